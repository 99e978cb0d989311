// Fork of a Tokio-style buffered copy loop, extended with resizable buffers
// and an idle-timeout watchdog that resets on traffic in either direction.
//
// The buffer-resizing and `BufferedSplitter`/`ResizeBufRead`/`AsyncWriteBuf`
// scaffolding below is adapted from the agentgateway proxy's connection
// splicer; the idle-timeout wrapper and `ConnectionResult` counters are new,
// grounded on the same shape but specialized to this proxy's single
// inactivity timer instead of a metrics-recorder trait.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pin_project_lite::pin_project;
use std::future::Future;
use std::io::IoSlice;
use std::marker::PhantomPinned;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};
use tokio::io;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;

/// Splits an I/O object into a buffered reader half and a writer half.
pub trait BufferedSplitter: Unpin {
	type R: ResizeBufRead + Unpin;
	type W: AsyncWriteBuf + Unpin;
	fn split_into_buffered_reader(self) -> (Self::R, Self::W);
}

impl<I> BufferedSplitter for I
where
	I: AsyncRead + AsyncWrite + Unpin,
{
	type R = BufReader<io::ReadHalf<I>>;
	type W = WriteAdapter<io::WriteHalf<I>>;
	fn split_into_buffered_reader(self) -> (Self::R, Self::W) {
		let (rh, wh) = tokio::io::split(self);
		(BufReader::new(rh), WriteAdapter(wh))
	}
}

/// Specialized splitter for `TcpStream`, avoiding the lock `tokio::io::split` needs.
pub struct TcpStreamSplitter(pub TcpStream);

impl BufferedSplitter for TcpStreamSplitter {
	type R = BufReader<OwnedReadHalf>;
	type W = WriteAdapter<OwnedWriteHalf>;

	fn split_into_buffered_reader(self) -> (Self::R, Self::W) {
		let (rh, wh) = self.0.into_split();
		(BufReader::new(rh), WriteAdapter(wh))
	}
}

/// Like `AsyncWrite`, but writes a `Bytes` instead of a `&[u8]` to avoid copies.
pub trait AsyncWriteBuf {
	fn poll_write_buf(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: Bytes,
	) -> Poll<std::io::Result<usize>>;
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>>;
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>>;
}

pub struct WriteAdapter<T>(T);

impl<T: AsyncWrite + Unpin> AsyncWriteBuf for WriteAdapter<T> {
	fn poll_write_buf(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		mut buf: Bytes,
	) -> Poll<std::io::Result<usize>> {
		poll_write_buf(Pin::new(&mut self.0), cx, &mut buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.0).poll_flush(cx)
	}

	fn poll_shutdown(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.0).poll_shutdown(cx)
	}
}

/// Like `AsyncBufRead`, but allows triggering a buffer resize.
pub trait ResizeBufRead {
	fn poll_bytes(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<Bytes>>;
	fn resize(self: Pin<&mut Self>, new_size: usize);
}

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("while closing connection: {0}")]
	ShutdownError(Box<CopyError>),

	#[error("destination disconnected before all data was written")]
	BackendDisconnected,
	#[error("receive: {0}")]
	ReceiveError(Box<CopyError>),

	#[error("client disconnected before all data was written")]
	ClientDisconnected,
	#[error("send: {0}")]
	SendError(Box<CopyError>),

	#[error("connection idle for longer than the inactivity timeout")]
	IdleTimeout,
}

const INITIAL_BUFFER_SIZE: usize = 1024;
const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
const JUMBO_BUFFER_SIZE: usize = (16 * 16_384) - 64;
const RESIZE_THRESHOLD_LARGE: u64 = 128 * 1024;
const RESIZE_THRESHOLD_JUMBO: u64 = 10 * 1024 * 1024;

/// Running totals and a shared idle clock for one spliced connection.
pub struct ConnectionResult {
	sent: AtomicU64,
	received: AtomicU64,
	last_activity_millis: AtomicU64,
	start: Instant,
}

impl Default for ConnectionResult {
	fn default() -> Self {
		Self::new()
	}
}

impl ConnectionResult {
	pub fn new() -> Self {
		Self {
			sent: AtomicU64::new(0),
			received: AtomicU64::new(0),
			last_activity_millis: AtomicU64::new(0),
			start: Instant::now(),
		}
	}

	pub fn increment_recv(&self, n: u64) {
		self.received.fetch_add(n, Ordering::Relaxed);
		self.touch();
	}

	pub fn increment_send(&self, n: u64) {
		self.sent.fetch_add(n, Ordering::Relaxed);
		self.touch();
	}

	fn touch(&self) {
		let now = self.start.elapsed().as_millis() as u64;
		self.last_activity_millis.store(now, Ordering::Relaxed);
	}

	pub fn sent(&self) -> u64 {
		self.sent.load(Ordering::Relaxed)
	}

	pub fn received(&self) -> u64 {
		self.received.load(Ordering::Relaxed)
	}

	fn idle_for(&self) -> Duration {
		let last = self.last_activity_millis.load(Ordering::Relaxed);
		let now = self.start.elapsed().as_millis() as u64;
		Duration::from_millis(now.saturating_sub(last))
	}
}

/// Splice `downstream` and `upstream` together until either side closes, or
/// `idle_timeout` elapses with zero bytes moved in both directions.
pub async fn copy_bidirectional<A, B>(
	downstream: A,
	upstream: B,
	stats: &ConnectionResult,
	idle_timeout: Duration,
) -> Result<(), CopyError>
where
	A: BufferedSplitter,
	B: BufferedSplitter,
{
	let (mut rd, mut wd) = downstream.split_into_buffered_reader();
	let (mut ru, mut wu) = upstream.split_into_buffered_reader();

	let downstream_to_upstream = async {
		let translate_error = |e: io::Error| {
			CopyError::SendError(Box::new(match e.kind() {
				io::ErrorKind::NotConnected => CopyError::BackendDisconnected,
				io::ErrorKind::WriteZero => CopyError::BackendDisconnected,
				io::ErrorKind::UnexpectedEof => CopyError::ClientDisconnected,
				_ => e.into(),
			}))
		};
		let res =
			ignore_io_errors(copy_buf(&mut rd, &mut wu, stats, false).await).map_err(translate_error);
		trace!(?res, "send");
		ignore_shutdown_errors(shutdown(&mut wu).await)
			.map_err(translate_error)
			.map_err(|e| CopyError::ShutdownError(Box::new(e)))?;
		res
	};

	let upstream_to_downstream = async {
		let translate_error = |e: io::Error| {
			CopyError::ReceiveError(Box::new(match e.kind() {
				io::ErrorKind::NotConnected => CopyError::ClientDisconnected,
				io::ErrorKind::WriteZero => CopyError::ClientDisconnected,
				_ => e.into(),
			}))
		};
		let res =
			ignore_io_errors(copy_buf(&mut ru, &mut wd, stats, true).await).map_err(translate_error);
		trace!(?res, "receive");
		ignore_shutdown_errors(shutdown(&mut wd).await)
			.map_err(translate_error)
			.map_err(|e| CopyError::ShutdownError(Box::new(e)))?;
		res
	};

	let traffic = async {
		let (sent, received) = tokio::join!(downstream_to_upstream, upstream_to_downstream);
		let sent = sent?;
		let received = received?;
		trace!(sent, received, "copy complete");
		Ok::<(), CopyError>(())
	};

	tokio::pin!(traffic);
	loop {
		tokio::select! {
			res = &mut traffic => return res,
			_ = tokio::time::sleep(idle_check_interval(idle_timeout)) => {
				if stats.idle_for() >= idle_timeout {
					return Err(CopyError::IdleTimeout);
				}
			}
		}
	}
}

fn idle_check_interval(idle_timeout: Duration) -> Duration {
	// Wake up often enough to notice the timeout promptly without busy-looping.
	(idle_timeout / 4).max(Duration::from_millis(250))
}

fn ignore_io_errors<T: Default>(res: Result<T, io::Error>) -> Result<T, io::Error> {
	use io::ErrorKind::*;
	match &res {
		Err(e) => match e.kind() {
			NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe => {
				trace!(err=%e, "io terminated ungracefully");
				Ok(Default::default())
			},
			_ => res,
		},
		_ => res,
	}
}

fn ignore_shutdown_errors(res: Result<(), io::Error>) -> Result<(), io::Error> {
	match &res {
		Err(e)
			if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::UnexpectedEof =>
		{
			trace!(err=%e, "failed to shutdown peer, they already shutdown");
			Ok(())
		},
		_ => res,
	}
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
struct CopyBuf<'a, R: ?Sized, W: ?Sized> {
	send: bool,
	reader: &'a mut R,
	writer: &'a mut W,
	buf: Option<Bytes>,
	stats: &'a ConnectionResult,
	amt: u64,
}

async fn copy_buf<'a, R, W>(
	reader: &'a mut R,
	writer: &'a mut W,
	stats: &ConnectionResult,
	is_send: bool,
) -> std::io::Result<u64>
where
	R: ResizeBufRead + Unpin + ?Sized,
	W: AsyncWriteBuf + Unpin + ?Sized,
{
	CopyBuf {
		send: is_send,
		reader,
		writer,
		buf: None,
		stats,
		amt: 0,
	}
	.await
}

impl<R, W> Future for CopyBuf<'_, R, W>
where
	R: ResizeBufRead + Unpin + ?Sized,
	W: AsyncWriteBuf + Unpin + ?Sized,
{
	type Output = std::io::Result<u64>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		loop {
			let me = &mut *self;

			let buffer = if let Some(buffer) = me.buf.take() {
				buffer
			} else {
				ready!(Pin::new(&mut *me.reader).poll_bytes(cx))?
			};
			if buffer.is_empty() {
				ready!(AsyncWriteBuf::poll_flush(Pin::new(&mut self.writer), cx))?;
				return Poll::Ready(Ok(self.amt));
			}

			let mut our_copy = buffer.clone();
			let i = match Pin::new(&mut *me.writer).poll_write_buf(cx, buffer) {
				Poll::Ready(written) => written?,
				Poll::Pending => {
					me.buf = Some(our_copy);
					return Poll::Pending;
				},
			};
			if i == 0 {
				return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
			}
			if i < our_copy.len() {
				our_copy.advance(i);
				me.buf = Some(our_copy);
			}
			if me.send {
				me.stats.increment_send(i as u64);
			} else {
				me.stats.increment_recv(i as u64);
			}
			let old = self.amt;
			self.amt += i as u64;

			if old < RESIZE_THRESHOLD_LARGE && RESIZE_THRESHOLD_LARGE <= self.amt {
				Pin::new(&mut *self.reader).resize(LARGE_BUFFER_SIZE);
			}
			if old < RESIZE_THRESHOLD_JUMBO && RESIZE_THRESHOLD_JUMBO <= self.amt {
				Pin::new(&mut *self.reader).resize(JUMBO_BUFFER_SIZE);
			}
		}
	}
}

pin_project! {
	pub struct BufReader<R> {
		#[pin]
		inner: R,
		buf: BytesMut,
		buffer_size: usize,
	}
}

impl<R: AsyncRead> BufReader<R> {
	pub fn new(inner: R) -> Self {
		Self {
			inner,
			buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
			buffer_size: INITIAL_BUFFER_SIZE,
		}
	}
}

impl<R: AsyncRead> ResizeBufRead for BufReader<R> {
	fn poll_bytes(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<Bytes>> {
		let me = self.project();
		me.buf.reserve(*me.buffer_size);
		ready!(poll_read_buf(me.inner, cx, me.buf))?;
		Poll::Ready(Ok(me.buf.split().freeze()))
	}

	fn resize(self: Pin<&mut Self>, new_size: usize) {
		let me = self.project();
		*me.buffer_size = new_size;
	}
}

pin_project! {
	#[must_use = "futures do nothing unless you `.await` or poll them"]
	struct Shutdown<'a, A: ?Sized> {
		a: &'a mut A,
		#[pin]
		_pin: PhantomPinned,
	}
}

fn shutdown<A>(a: &mut A) -> Shutdown<'_, A>
where
	A: AsyncWriteBuf + Unpin + ?Sized,
{
	Shutdown { a, _pin: PhantomPinned }
}

impl<A> Future for Shutdown<'_, A>
where
	A: AsyncWriteBuf + Unpin + ?Sized,
{
	type Output = std::io::Result<()>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let me = self.project();
		AsyncWriteBuf::poll_shutdown(Pin::new(me.a), cx)
	}
}

pub fn poll_write_buf<T: AsyncWrite + ?Sized, B: Buf>(
	io: Pin<&mut T>,
	cx: &mut Context<'_>,
	buf: &mut B,
) -> Poll<std::io::Result<usize>> {
	const MAX_BUFS: usize = 64;

	if !buf.has_remaining() {
		return Poll::Ready(Ok(0));
	}

	let n = if io.is_write_vectored() {
		let mut slices = [IoSlice::new(&[]); MAX_BUFS];
		let cnt = buf.chunks_vectored(&mut slices);
		ready!(io.poll_write_vectored(cx, &slices[..cnt]))?
	} else {
		ready!(io.poll_write(cx, buf.chunk()))?
	};

	buf.advance(n);
	Poll::Ready(Ok(n))
}

pub fn poll_read_buf<T: AsyncRead + ?Sized, B: BufMut>(
	io: Pin<&mut T>,
	cx: &mut Context<'_>,
	buf: &mut B,
) -> Poll<std::io::Result<usize>> {
	if !buf.has_remaining_mut() {
		return Poll::Ready(Ok(0));
	}

	let n = {
		let dst = buf.chunk_mut();
		let dst = unsafe { &mut *(dst as *mut _ as *mut [MaybeUninit<u8>]) };
		let mut buf = ReadBuf::uninit(dst);
		let ptr = buf.filled().as_ptr();
		ready!(io.poll_read(cx, &mut buf)?);
		assert_eq!(ptr, buf.filled().as_ptr());
		buf.filled().len()
	};

	unsafe {
		buf.advance_mut(n);
	}

	Poll::Ready(Ok(n))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

	#[tokio::test]
	async fn splices_bytes_both_ways() {
		let (client, client_remote) = duplex(64);
		let (backend, backend_remote) = duplex(64);
		let stats = ConnectionResult::new();

		let splice = tokio::spawn(async move {
			copy_bidirectional(client_remote, backend_remote, &stats, Duration::from_secs(5)).await
		});

		let mut client = client;
		let mut backend = backend;
		client.write_all(b"hello backend").await.unwrap();
		client.shutdown().await.unwrap();
		let mut seen = Vec::new();
		backend.read_to_end(&mut seen).await.unwrap();
		assert_eq!(seen, b"hello backend");

		backend.write_all(b"hello client").await.unwrap();
		backend.shutdown().await.unwrap();
		let mut seen = Vec::new();
		client.read_to_end(&mut seen).await.unwrap();
		assert_eq!(seen, b"hello client");

		splice.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn idle_timeout_closes_connection() {
		let (client, client_remote) = duplex(64);
		let (_backend, backend_remote) = duplex(64);
		let stats = ConnectionResult::new();

		let result = copy_bidirectional(
			client_remote,
			backend_remote,
			&stats,
			Duration::from_millis(100),
		)
		.await;
		drop(client);
		assert!(matches!(result, Err(CopyError::IdleTimeout)));
	}
}
