use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Serves `GET /v3/playlistItems` from fixed pages. Page `n > 0` is reached
/// with `pageToken=page-<n>`.
pub struct ListingStub {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
pub enum StubMode {
    Pages(Vec<Vec<(&'static str, &'static str)>>),
    QuotaExceeded,
}

impl ListingStub {
    pub fn spawn(mode: StubMode) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start listing stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v3");
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let url = url::Url::parse(&format!("http://stub{}", request.url()))
                    .expect("parse request url");
                if url.path() != "/v3/playlistItems" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let pages = match &mode {
                    StubMode::Pages(pages) => pages,
                    StubMode::QuotaExceeded => {
                        let body = serde_json::json!({
                            "error": { "code": 403, "message": "quotaExceeded" }
                        });
                        let _ = request.respond(
                            tiny_http::Response::from_string(body.to_string())
                                .with_status_code(403),
                        );
                        continue;
                    }
                };

                let token = url
                    .query_pairs()
                    .find(|(k, _)| k == "pageToken")
                    .map(|(_, v)| v.into_owned());
                let index = match token.as_deref() {
                    None => 0,
                    Some(token) => match token
                        .strip_prefix("page-")
                        .and_then(|n| n.parse::<usize>().ok())
                    {
                        Some(n) if n < pages.len() => n,
                        _ => {
                            let _ = request.respond(
                                tiny_http::Response::from_string("bad page token")
                                    .with_status_code(400),
                            );
                            continue;
                        }
                    },
                };

                let items: Vec<serde_json::Value> = pages[index]
                    .iter()
                    .map(|(title, video_id)| {
                        serde_json::json!({
                            "snippet": {
                                "title": title,
                                "resourceId": { "kind": "youtube#video", "videoId": video_id }
                            }
                        })
                    })
                    .collect();
                let mut body = serde_json::json!({ "items": items });
                if index + 1 < pages.len() {
                    body["nextPageToken"] = serde_json::Value::String(format!("page-{}", index + 1));
                }

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(body.to_string())
                    .with_status_code(200)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[allow(dead_code)]
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for ListingStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
