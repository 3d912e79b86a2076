//! Minimal HTTP responders occupying a run's port when no real app is serving it.

use std::io;
use std::net::TcpListener as StdTcpListener;

use axum::Router;
use axum::http::StatusCode;
use axum::response::Html;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a placeholder responder shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderPage {
    /// Stub mode: no build happened.
    Simulated { repo: String, branch: String },
    /// A failed run's redacted error text.
    Error { message: String },
}

impl PlaceholderPage {
    fn status(&self) -> StatusCode {
        match self {
            Self::Simulated { .. } => StatusCode::OK,
            Self::Error { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_page(page: &PlaceholderPage) -> String {
    let (title, body) = match page {
        PlaceholderPage::Simulated { repo, branch } => (
            "Simulated preview",
            format!(
                "<p>Simulated preview for <code>{}</code> at <code>{}</code>.</p>",
                escape_html(repo),
                escape_html(branch)
            ),
        ),
        PlaceholderPage::Error { message } => (
            "Preview failed",
            format!("<pre>{}</pre>", escape_html(message)),
        ),
    };
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1>{body}</body></html>\n"
    )
}

/// Owner of a running responder. Dropping it shuts the responder down.
#[derive(Debug)]
pub struct PlaceholderHandle {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
}

impl PlaceholderHandle {
    pub fn new(port: u16, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            port,
            shutdown: Some(shutdown),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PlaceholderHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Starts placeholder responders. Binding is synchronous so callers can do it
/// while holding the supervisor's registry lock.
pub trait PlaceholderHost: Send + Sync {
    fn serve(&self, port: u16, page: PlaceholderPage) -> io::Result<PlaceholderHandle>;
}

/// Placeholder responders backed by axum. Must be used inside a tokio runtime.
pub struct AxumPlaceholderHost {
    host: String,
}

impl AxumPlaceholderHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl PlaceholderHost for AxumPlaceholderHost {
    fn serve(&self, port: u16, page: PlaceholderPage) -> io::Result<PlaceholderHandle> {
        let std_listener = StdTcpListener::bind((self.host.as_str(), port))?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(std_listener)?;

        let status = page.status();
        let html = render_page(&page);
        let app = Router::new().fallback(move || {
            let html = html.clone();
            async move { (status, Html(html)) }
        });

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            match served {
                Ok(()) => debug!(port, "placeholder responder stopped"),
                Err(e) => warn!(port, error = %e, "placeholder responder failed"),
            }
        });
        debug!(port, "placeholder responder started");
        Ok(PlaceholderHandle::new(port, tx))
    }
}

#[cfg(test)]
pub mod fakes {
    use std::sync::Mutex;

    use tokio::sync::oneshot::error::TryRecvError;

    use super::*;

    /// Records served pages; a responder counts as live until its handle is
    /// shut down or dropped.
    #[derive(Default)]
    pub struct FakePlaceholderHost {
        served: Mutex<Vec<(u16, PlaceholderPage, oneshot::Receiver<()>)>>,
    }

    impl FakePlaceholderHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn live(&self) -> Vec<(u16, PlaceholderPage)> {
            let mut served = self.served.lock().unwrap();
            let mut live = Vec::new();
            for (port, page, rx) in served.iter_mut() {
                if matches!(rx.try_recv(), Err(TryRecvError::Empty)) {
                    live.push((*port, page.clone()));
                }
            }
            live
        }

        pub fn served_count(&self) -> usize {
            self.served.lock().unwrap().len()
        }
    }

    impl PlaceholderHost for FakePlaceholderHost {
        fn serve(&self, port: u16, page: PlaceholderPage) -> io::Result<PlaceholderHandle> {
            let (tx, rx) = oneshot::channel();
            self.served.lock().unwrap().push((port, page, rx));
            Ok(PlaceholderHandle::new(port, tx))
        }
    }
}
