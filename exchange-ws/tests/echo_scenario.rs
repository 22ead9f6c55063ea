//! A simulated `/ws` echo round trip: the client subscribes to text
//! messages, sends three, a fake server greets with one message up front
//! and echoes each of the three back, and the client observes exactly the
//! four messages in order before closing.

use bytes::Bytes;
use exchange_ws::{
    encode_frame, try_decode_frame, ConnectionDriver, Decoded, Message, OpCode, WsConfig,
};
use futures_util::stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn text_message_echo_round_trip() {
    let (client_io, mut server_io) = tokio::io::duplex(16 * 1024);
    let config = WsConfig {
        close_on_complete: false,
        ..WsConfig::default()
    };
    let (conn, driver) = ConnectionDriver::new(client_io, config, Bytes::new(), None);
    tokio::spawn(driver.run());

    let server = tokio::spawn(async move {
        server_io
            .write_all(&encode_frame(OpCode::Text, true, b"ws", false))
            .await
            .expect("write greeting");

        let mut buf = vec![0u8; 4096];
        let mut pending = Vec::new();
        let mut echoed = 0;
        let mut closed = false;

        while echoed < 3 || !closed {
            let n = server_io.read(&mut buf).await.expect("read from client");
            assert!(n > 0, "client connection closed before the scenario finished");
            pending.extend_from_slice(&buf[..n]);

            loop {
                match try_decode_frame(&pending, None, true).expect("decode client frame") {
                    Decoded::Incomplete => break,
                    Decoded::Frame { frame, consumed, .. } => {
                        pending.drain(..consumed);
                        match frame.opcode() {
                            OpCode::Text => {
                                let payload = frame.into_payload();
                                server_io
                                    .write_all(&encode_frame(OpCode::Text, true, &payload, false))
                                    .await
                                    .expect("echo back");
                                echoed += 1;
                            }
                            OpCode::Close => {
                                let payload = frame.into_payload();
                                let _ = server_io
                                    .write_all(&encode_frame(OpCode::Close, true, &payload, false))
                                    .await;
                                closed = true;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    });

    let mut text = conn.text_messages().await.expect("subscribe text_messages");

    conn.send_messages(stream::iter(vec![
        Message::Text("a".to_string()),
        Message::Text("b".to_string()),
        Message::Text("c".to_string()),
    ]))
    .expect("install outbound publisher");

    let mut observed = Vec::new();
    for _ in 0..4 {
        let message = text.next().await.expect("expected a text message");
        observed.push(message);
    }

    assert_eq!(observed, vec!["ws", "a", "b", "c"]);

    conn.close().await.expect("close handshake");
    server.await.expect("server task panicked");
}
