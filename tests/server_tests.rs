mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::{respond, template};
use mockd::{common::runtime, prelude::*};
use std::net::SocketAddr;
use tokio::sync::oneshot;

struct RunningServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RunningServer {
    fn start() -> Self {
        let (addr_tx, addr_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let rt = runtime::new(2, 2).expect("cannot build runtime");
            rt.block_on(async move {
                let server = MockdServerBuilder::new().build();
                server
                    .start_with_signals(Some(addr_tx), async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .expect("server failed");
            });
        });

        let addr = addr_rx.blocking_recv().expect("server did not publish its address");

        RunningServer {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn control_plane_round_trip_test() {
    let server = RunningServer::start();
    let client = reqwest::blocking::Client::new();

    let res = client.get(server.url("/__mockd__/ping")).send().unwrap();
    assert_eq!(res.status(), 200);

    // Register an expectation through the control plane.
    let definition = ExpectationDefinition::new(template("GET", "/hello"), respond(200, "hi"));
    let res = client
        .post(server.url("/__mockd__/expectations"))
        .json(&definition)
        .send()
        .unwrap();
    assert_eq!(res.status(), 201);
    let created: ActiveExpectation = res.json().unwrap();

    // The data plane serves it.
    let res = client.get(server.url("/hello")).send().unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().unwrap(), "hi");

    let res = client.get(server.url("/unknown")).send().unwrap();
    assert_eq!(res.status(), 404);

    // Verification sees exactly one matching request.
    let res = client
        .post(server.url("/__mockd__/verify"))
        .json(&VerificationRequest {
            request: template("GET", "/hello"),
            times: VerificationTimes::exactly(1),
        })
        .send()
        .unwrap();
    assert_eq!(res.status(), 202);

    let res = client
        .post(server.url("/__mockd__/verify"))
        .json(&VerificationRequest {
            request: template("GET", "/hello"),
            times: VerificationTimes::exactly(2),
        })
        .send()
        .unwrap();
    assert_eq!(res.status(), 406);
    let body = res.text().unwrap();
    assert!(body.contains("Request not found exactly 2 times"));

    // Retrieval returns the recorded traffic.
    let res = client
        .post(server.url("/__mockd__/retrieve?type=requests"))
        .send()
        .unwrap();
    assert_eq!(res.status(), 200);
    let body = res.text().unwrap();
    assert!(body.contains("/hello"));
    assert!(body.contains("/unknown"));

    // Delete the expectation, then reset all state.
    let res = client
        .delete(server.url(&format!("/__mockd__/expectations/{}", created.id)))
        .send()
        .unwrap();
    assert_eq!(res.status(), 204);

    let res = client.delete(server.url("/__mockd__/state")).send().unwrap();
    assert_eq!(res.status(), 204);

    let res = client
        .post(server.url("/__mockd__/retrieve?type=active_expectations"))
        .send()
        .unwrap();
    let body = res.text().unwrap();
    assert!(!body.contains("/hello"));
}

#[test]
fn sequence_verification_over_http_test() {
    let server = RunningServer::start();
    let client = reqwest::blocking::Client::new();

    client
        .post(server.url("/__mockd__/expectations"))
        .json(&ExpectationDefinition::new(
            RequestTemplate::default(),
            respond(200, "ok"),
        ))
        .send()
        .unwrap();

    client.post(server.url("/first")).send().unwrap();
    client.post(server.url("/second")).send().unwrap();

    let res = client
        .post(server.url("/__mockd__/verify/sequence"))
        .json(&SequenceVerificationRequest {
            requests: vec![template("POST", "/first"), template("POST", "/second")],
        })
        .send()
        .unwrap();
    assert_eq!(res.status(), 202);

    let res = client
        .post(server.url("/__mockd__/verify/sequence"))
        .json(&SequenceVerificationRequest {
            requests: vec![template("POST", "/second"), template("POST", "/first")],
        })
        .send()
        .unwrap();
    assert_eq!(res.status(), 406);
}

#[test]
fn raw_bytes_on_the_wire_test() {
    let server = RunningServer::start();
    let client = reqwest::blocking::Client::new();

    let raw = "HTTP/1.1 418 I'm a teapot\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    client
        .post(server.url("/__mockd__/expectations"))
        .json(&ExpectationDefinition::new(
            template("GET", "/teapot"),
            Action::Error {
                drop_connection: false,
                response_bytes: Some(BASE64.encode(raw)),
                delay: None,
            },
        ))
        .send()
        .unwrap();

    let res = client.get(server.url("/teapot")).send().unwrap();
    assert_eq!(res.status(), 418);
}

#[test]
fn dropped_connection_test() {
    let server = RunningServer::start();
    let client = reqwest::blocking::Client::new();

    client
        .post(server.url("/__mockd__/expectations"))
        .json(&ExpectationDefinition::new(
            template("GET", "/dead"),
            Action::Error {
                drop_connection: true,
                response_bytes: None,
                delay: None,
            },
        ))
        .send()
        .unwrap();

    assert!(client.get(server.url("/dead")).send().is_err());
}
