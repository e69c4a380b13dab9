//! Accept a stream of transports and drive one connection per transport.
//!
//! [`Server`] handles a single already-accepted connection. [`Listener`]
//! wraps it with a [`MilterFactory`] and an accept loop, so a caller only
//! has to adapt their own listener (`tokio::net::TcpListener`,
//! `UnixListener`, ...) into a `Stream` of transports and hand it over
//! together with a [`Spawn`] executor handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{abortable, AbortHandle};
use futures::task::{Spawn, SpawnExt};
use futures::{AsyncRead, AsyncWrite, Stream, StreamExt};

use crate::{MilterFactory, Server};

/// A read-only view of a [`ShutdownHandle`]'s stop flag.
///
/// Handed to [`Server::with_stop_signal`](crate::Server::with_stop_signal) so
/// a connection can notice a shutdown request between messages and close
/// itself instead of waiting to be force-aborted at the deadline.
#[derive(Clone, Debug)]
pub struct StopSignal {
    stopping: Arc<AtomicBool>,
}

impl StopSignal {
    /// Whether a shutdown has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// A handle to request a graceful shutdown of a running [`Listener`].
///
/// Cloning shares the same stop flag and in-flight connection registry;
/// any clone may request shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    stopping: Arc<AtomicBool>,
    in_flight: Arc<Mutex<Vec<AbortHandle>>>,
}

impl ShutdownHandle {
    pub(crate) fn new() -> Self {
        Self {
            stopping: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// A cheap, cloneable read-only view of the stop flag, for handing to a
    /// [`Server`].
    pub(crate) fn signal(&self) -> StopSignal {
        StopSignal {
            stopping: Arc::clone(&self.stopping),
        }
    }

    fn track(&self, handle: AbortHandle) {
        // Lock is only ever held for a `Vec::push`/drain, never across an
        // await point, so a std Mutex is fine here.
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    /// Stop accepting new connections, wait for `deadline` to resolve, then
    /// abort whichever connection futures are still running.
    ///
    /// Sessions that finish on their own before `deadline` elapses close
    /// normally; the ones still in flight at the deadline are dropped
    /// mid-message, same as a transport failure would be.
    pub async fn shutdown(&self, deadline: impl std::future::Future<Output = ()>) {
        self.stopping.store(true, Ordering::Release);
        deadline.await;
        let handles = std::mem::take(
            &mut *self
                .in_flight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
    }
}

/// Drives a factory-produced [`Milter`] for every transport an incoming
/// stream yields.
///
/// Keeps the core transport- and executor-agnostic: the library never
/// touches a socket type or spawns onto a specific runtime directly.
#[derive(Debug)]
pub struct Listener<F> {
    factory: F,
    quit_on_abort: bool,
    max_buffer_size: usize,
    shutdown: ShutdownHandle,
}

impl<F: MilterFactory> Listener<F> {
    pub fn new(factory: F, quit_on_abort: bool, max_buffer_size: usize) -> Self {
        Self {
            factory,
            quit_on_abort,
            max_buffer_size,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Sensible defaults for talking to postfix: close the connection on
    /// `ABORT` and cap a single frame at 64KiB.
    #[must_use]
    pub fn default_postfix(factory: F) -> Self {
        Self::new(factory, true, 2_usize.pow(16))
    }

    /// A cloneable handle to stop this listener. Grab one before calling
    /// [`Listener::serve`] (typically the listener is wrapped in an `Arc`
    /// and `serve` spawned onto its own task) so it can be triggered from
    /// elsewhere while `serve` is running.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept transports from `incoming` until the stream ends or
    /// [`ShutdownHandle::shutdown`] is called on a handle obtained via
    /// [`Listener::shutdown_handle`], spawning one scheduler unit per
    /// connection via `spawner`.
    ///
    /// A transport that fails to accept is skipped; the loop keeps going.
    /// Errors from an individual connection (protocol, io, filter panics
    /// already converted to `Tempfail`) are not surfaced here, matching
    /// [`Server::handle_connection`]'s contract of failing only the one
    /// connection.
    pub async fn serve<Sp, St, RW>(&self, mut incoming: St, spawner: Sp)
    where
        Sp: Spawn,
        St: Stream<Item = std::io::Result<RW>> + Unpin,
        RW: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F::Milter: 'static,
    {
        while !self.shutdown.is_stopping() {
            let Some(accepted) = incoming.next().await else {
                break;
            };
            let Ok(socket) = accepted else {
                continue;
            };

            let mut milter = self.factory.create();
            let quit_on_abort = self.quit_on_abort;
            let max_buffer_size = self.max_buffer_size;
            let stop_signal = self.shutdown.signal();

            let (task, handle) = abortable(async move {
                let mut server =
                    Server::new(&mut milter, quit_on_abort, max_buffer_size).with_stop_signal(stop_signal);
                let _ = server.handle_connection(socket).await;
            });
            self.shutdown.track(handle);

            if spawner
                .spawn(async move {
                    let _ = task.await;
                })
                .is_err()
            {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_handle_flips_stop_flag() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_stopping());
        futures::executor::block_on(handle.shutdown(futures::future::ready(())));
        assert!(handle.is_stopping());
    }

    #[test]
    fn signal_observes_shutdown_through_a_clone() {
        let handle = ShutdownHandle::new();
        let signal = handle.signal();
        assert!(!signal.is_stopping());

        futures::executor::block_on(handle.shutdown(futures::future::ready(())));

        assert!(signal.is_stopping());
    }
}
