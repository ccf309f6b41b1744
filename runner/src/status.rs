use crate::{ledger::FinishRecord, scheduler::window::WindowReport};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use solverbot_data::{Job, ScoreSummary};
use std::{
    collections::BTreeMap,
    io,
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to bind status server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to build status server runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("failed to start status server thread: {0}")]
    Thread(#[source] io::Error),
}

/// One active run as reported on `/running`
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunningRecord {
    pub cwd: PathBuf,
    /// start time, RFC 3339
    pub s: String,
    /// start time, unix seconds
    pub sn: i64,
    pub cfg: Job,
}

/// Everything the status endpoints can show
pub trait StatusSource: Send + Sync + 'static {
    fn best(&self) -> BTreeMap<String, ScoreSummary>;
    fn best_full(&self) -> BTreeMap<String, FinishRecord>;
    fn running(&self) -> Vec<RunningRecord>;
    fn failures(&self) -> WindowReport;
}

type Source = Arc<dyn StatusSource>;

pub fn router(source: Source) -> Router {
    Router::new()
        .route("/best", get(best))
        .route("/best/full", get(best_full))
        .route("/running", get(running))
        .route("/failures", get(failures))
        .fallback(nope)
        .with_state(source)
}

async fn best(State(source): State<Source>) -> Json<BTreeMap<String, ScoreSummary>> {
    Json(source.best())
}

async fn best_full(State(source): State<Source>) -> Json<BTreeMap<String, FinishRecord>> {
    Json(source.best_full())
}

async fn running(State(source): State<Source>) -> Json<Vec<RunningRecord>> {
    Json(source.running())
}

async fn failures(State(source): State<Source>) -> Json<WindowReport> {
    Json(source.failures())
}

async fn nope() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "nope")
}

/// Status http server on its own thread with a single threaded runtime
#[derive(Debug)]
pub struct StatusServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StatusServer {
    pub fn start(addr: SocketAddr, source: Source) -> Result<Self, StatusError> {
        let listener = TcpListener::bind(addr)
            .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
            .map_err(|source| StatusError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| StatusError::Bind { addr, source })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StatusError::Runtime)?;
        let (shutdown, stopped) = oneshot::channel::<()>();
        let app = router(source);

        let handle = thread::Builder::new()
            .name("status".into())
            .spawn(move || {
                let served = runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            let _ = stopped.await;
                        })
                        .await
                });

                if let Err(error) = served {
                    error!(error = ?error, addr = %addr, "Status server failed: {error}");
                }
            })
            .map_err(StatusError::Thread)?;

        info!(addr = %addr, "Serving status");

        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Status server thread panicked");
            }
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::window::{FailureWindow, Outcome};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::path::Path;
    use tower::ServiceExt;

    struct Fixed;

    fn score(kmpp: f64) -> ScoreSummary {
        ScoreSummary {
            kmpp,
            spread: 2.0,
            std: 1.0,
        }
    }

    impl StatusSource for Fixed {
        fn best(&self) -> BTreeMap<String, ScoreSummary> {
            BTreeMap::from([("NC_Congress".to_string(), score(41.5))])
        }

        fn best_full(&self) -> BTreeMap<String, FinishRecord> {
            BTreeMap::new()
        }

        fn running(&self) -> Vec<RunningRecord> {
            vec![RunningRecord {
                cwd: Path::new("/work/NC_Congress/20240101_120000_0042").to_path_buf(),
                s: "2024-01-01T12:00:00+00:00".into(),
                sn: 1_704_110_400,
                cfg: Job::new("NC_Congress", "NC"),
            }]
        }

        fn failures(&self) -> WindowReport {
            let mut window = FailureWindow::new(5, 11);
            window.push(Outcome::Failure);
            window.report()
        }
    }

    async fn get_json(uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(Arc::new(Fixed))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();

        (status, body.to_vec())
    }

    #[tokio::test]
    async fn best_scores() {
        let (status, body) = get_json("/best").await;

        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["NC_Congress"]["Kmpp"], 41.5);
    }

    #[tokio::test]
    async fn running_uses_short_names() {
        let (_, body) = get_json("/running").await;

        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value[0]["cwd"], "/work/NC_Congress/20240101_120000_0042");
        assert_eq!(value[0]["sn"], 1_704_110_400);
        assert_eq!(value[0]["cfg"]["st"], "NC");
    }

    #[tokio::test]
    async fn failures_window() {
        let (_, body) = get_json("/failures").await;

        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({"window": [1], "failures": 1, "capacity": 11}));
    }

    #[tokio::test]
    async fn unknown_path_is_nope() {
        let (status, body) = get_json("/index.html").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"nope");
    }

    #[test]
    fn serves_on_its_own_thread() {
        let server = StatusServer::start("127.0.0.1:0".parse().unwrap(), Arc::new(Fixed)).unwrap();
        let url = format!("http://{}/best", server.local_addr());

        let body = reqwest::blocking::get(url).unwrap().text().unwrap();
        assert!(body.contains("NC_Congress"));

        server.stop();
    }
}
