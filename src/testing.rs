//! A local HTTP server answering Consul API paths with canned responses.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

#[derive(Clone)]
struct Reply {
    index: Option<u64>,
    body: String,
}

#[derive(Default)]
pub(crate) struct ConsulServer {
    routes: HashMap<String, Reply>,
}

impl ConsulServer {
    pub(crate) fn new() -> Self {
        ConsulServer::default()
    }

    /// Answer `path` with `body` and, if set, an `X-Consul-Index` header.
    /// Unknown paths get a 404.
    pub(crate) fn route(mut self, path: &str, index: Option<u64>, body: &str) -> Self {
        self.routes.insert(
            path.to_string(),
            Reply {
                index,
                body: body.to_string(),
            },
        );
        self
    }

    pub(crate) async fn start(self) -> RunningServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(self.routes);
        let requests = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn({
            let requests = Arc::clone(&requests);

            async move {
                loop {
                    let (conn, _peer) = listener.accept().await.unwrap();
                    let routes = Arc::clone(&routes);
                    let requests = Arc::clone(&requests);

                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let resp = reply(&routes, &requests, &req);
                            async move { Ok::<_, Infallible>(resp) }
                        });

                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(conn), service)
                            .await;
                    });
                }
            }
        });

        RunningServer { addr, requests }
    }
}

fn reply(
    routes: &HashMap<String, Reply>,
    requests: &Mutex<Vec<String>>,
    req: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    requests.lock().unwrap().push(
        req.uri()
            .path_and_query()
            .map(ToString::to_string)
            .unwrap_or_default(),
    );

    match routes.get(path) {
        Some(reply) => {
            let mut builder = Response::builder();
            if let Some(index) = reply.index {
                builder = builder.header("X-Consul-Index", index);
            }

            builder.body(Full::from(reply.body.clone())).unwrap()
        }
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::default())
            .unwrap(),
    }
}

pub(crate) struct RunningServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl RunningServer {
    pub(crate) fn client(&self) -> consul::Client {
        let config = consul::Config {
            endpoint: format!("http://{}", self.addr),
            ..consul::Config::default()
        };

        consul::Client::new(&config).unwrap()
    }

    /// Path and query of every request served so far.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}
