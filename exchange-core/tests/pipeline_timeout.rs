//! Pipelining and per-exchange timeout cascade (spec §8 scenario 3): two
//! sequential GETs pipelined on the same connection, the first exceeds its
//! deadline after its headers have already reached the wire. The
//! connection is unrecoverable at that point: the first exchange resolves
//! with `RequestTimeout`, and the second (also in flight, with its own
//! deadline not yet due) resolves with `ConnectionResetByPeer` rather than
//! its own timeout, since the connection's shutdown is a side effect of the
//! first exchange's timeout, not its own.

use std::sync::Arc;
use std::time::Duration;

use exchange_core::exchange::{Authority, PathBuilder, RequestHandle};
use exchange_core::h1::{ConnectionDriver, Http1Config, NoopHooks};
use exchange_core::pool::NoopPoolCallbacks;
use exchange_core::transport::TransportInfo;
use http::Method;
use tokio::io::AsyncReadExt;

fn get_request(path: &str) -> RequestHandle {
    let authority = Authority::new("example.com", None, "http");
    let handle = RequestHandle::new(
        Method::GET,
        authority,
        PathBuilder::new(path),
        TransportInfo::plaintext(None, None),
        None,
    );
    Arc::try_unwrap(handle).unwrap_or_else(|_| unreachable!())
}

#[tokio::test(start_paused = true)]
async fn first_exchange_timeout_resets_pipelined_second() {
    let (client_io, mut server_io) = tokio::io::duplex(8192);

    let config = Http1Config {
        max_concurrent_requests: 10,
        request_timeout: Duration::from_millis(1000),
        ..Http1Config::default()
    };
    let (conn, driver) = ConnectionDriver::new(
        client_io,
        config,
        Box::new(NoopHooks),
        Arc::new(NoopPoolCallbacks),
    );
    tokio::spawn(driver.run());

    let first_rx = conn.send(get_request("/a"));

    let mut buf = vec![0u8; 1024];
    let n = server_io.read(&mut buf).await.expect("read first request");
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /a HTTP/1.1\r\n"));

    tokio::time::advance(Duration::from_millis(200)).await;
    let second_rx = conn.send(get_request("/b"));

    let n = server_io.read(&mut buf).await.expect("read second request");
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /b HTTP/1.1\r\n"));

    // Neither request gets a response; the server "hangs" well past both
    // deadlines, but only the first exchange's deadline is the one the
    // timer tick observes as headers-written-and-overdue first.
    tokio::time::advance(Duration::from_millis(2000)).await;

    let first = first_rx
        .await
        .expect("oneshot alive")
        .expect("exchange admitted");
    let first_err = first.response().await.expect_err("first exchange times out");
    assert_eq!(first_err.kind(), exchange_core::Kind::RequestTimeout);

    let second = second_rx
        .await
        .expect("oneshot alive")
        .expect("exchange admitted");
    let second_err = second
        .response()
        .await
        .expect_err("second exchange is reset, not separately timed out");
    assert_eq!(second_err.kind(), exchange_core::Kind::ConnectionResetByPeer);
}
