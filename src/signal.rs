use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::info;

/// Control messages from the OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalTo {
    /// Reload config and the target group list from disk
    ReloadFromDisk,
    /// Stop every watch task gracefully, then exit
    Shutdown,
    /// Exit immediately
    Quit,
}

pin_project! {
    pub struct Signals {
        #[pin]
        sigint: Signal,
        #[pin]
        sigterm: Signal,
        #[pin]
        sigquit: Signal,
        #[pin]
        sighup: Signal
    }
}

impl Stream for Signals {
    type Item = SignalTo;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if this.sigint.poll_recv(cx).is_ready() {
            info!(message = "Signal received", signal = "SIGINT");
            return Poll::Ready(Some(SignalTo::Shutdown));
        }

        if this.sigterm.poll_recv(cx).is_ready() {
            info!(message = "Signal received", signal = "SIGTERM");
            return Poll::Ready(Some(SignalTo::Shutdown));
        }

        if this.sigquit.poll_recv(cx).is_ready() {
            info!(message = "Signal received", signal = "SIGQUIT");
            return Poll::Ready(Some(SignalTo::Quit));
        }

        if this.sighup.poll_recv(cx).is_ready() {
            info!(message = "Signal received", signal = "SIGHUP");
            return Poll::Ready(Some(SignalTo::ReloadFromDisk));
        }

        Poll::Pending
    }
}

/// Signals from OS/user, must be called within a tokio runtime.
pub fn os_signals() -> std::io::Result<Signals> {
    Ok(Signals {
        sigint: signal(SignalKind::interrupt())?,
        sigterm: signal(SignalKind::terminate())?,
        sigquit: signal(SignalKind::quit())?,
        sighup: signal(SignalKind::hangup())?,
    })
}
