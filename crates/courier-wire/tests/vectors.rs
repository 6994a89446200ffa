use bytes::BytesMut;
use courier_wire::{
    ClientCodec, ClientOp, ConnectInfo, ServerCodec, ServerOp, decode_client_op,
    decode_server_op, encode_client_op, encode_server_op,
};
use futures::{SinkExt, StreamExt};
use std::fs;
use tokio_util::codec::{FramedRead, FramedWrite};

const MAX_PAYLOAD: usize = 1024 * 1024;

#[test]
fn vectors_reencode_canonically() {
    let dir = "tests/vectors";
    let mut seen = 0;
    for entry in fs::read_dir(dir).expect("read vectors dir") {
        let entry = entry.expect("entry");
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let contents = fs::read_to_string(&path).expect("read vector");
        let value: serde_json::Value = serde_json::from_str(&contents).expect("json");
        let side = value["side"].as_str().expect("side");
        let wire = value["wire"].as_str().expect("wire");
        let canonical = value["canonical"].as_str().expect("canonical");

        let mut input = BytesMut::from(wire);
        let mut output = BytesMut::new();
        match side {
            "client" => {
                while let Some(op) = decode_client_op(&mut input, MAX_PAYLOAD).expect("decode") {
                    encode_client_op(&op, &mut output).expect("encode");
                }
            }
            "server" => {
                while let Some(op) = decode_server_op(&mut input, MAX_PAYLOAD).expect("decode") {
                    encode_server_op(&op, &mut output).expect("encode");
                }
            }
            other => panic!("unknown side {other:?} in {path:?}"),
        }
        assert!(input.is_empty(), "leftover bytes in {path:?}");
        assert_eq!(
            String::from_utf8_lossy(&output),
            canonical,
            "canonical mismatch for {path:?}"
        );
        seen += 1;
    }
    assert!(seen > 0, "no vectors found");
}

#[tokio::test]
async fn framed_client_and_server_talk_over_a_duplex() {
    let (client_io, server_io) = tokio::io::duplex(64);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let mut client_tx = FramedWrite::new(client_write, ClientCodec::new(MAX_PAYLOAD));
    let mut client_rx = FramedRead::new(client_read, ClientCodec::new(MAX_PAYLOAD));
    let mut server_tx = FramedWrite::new(server_write, ServerCodec::new(MAX_PAYLOAD));
    let mut server_rx = FramedRead::new(server_read, ServerCodec::new(MAX_PAYLOAD));

    let payload = vec![b'x'; 300];
    let server = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(op) = server_rx.next().await {
            let op = op.expect("client op");
            if let ClientOp::Pub {
                subject, payload, ..
            } = &op
            {
                server_tx
                    .send(ServerOp::Msg {
                        subject: subject.clone(),
                        sid: "1".to_string(),
                        reply: None,
                        payload: payload.clone(),
                    })
                    .await
                    .expect("send msg");
            }
            if op == ClientOp::Ping {
                server_tx.send(ServerOp::Pong).await.expect("send pong");
            }
            received.push(op);
        }
        received
    });

    client_tx
        .send(ClientOp::Connect(ConnectInfo {
            auth_token: Some("s3cr3t".to_string()),
            ..ConnectInfo::default()
        }))
        .await
        .expect("connect");
    client_tx
        .send(ClientOp::Pub {
            subject: "bulk.data".to_string(),
            reply: None,
            payload: payload.clone().into(),
        })
        .await
        .expect("pub");
    client_tx.send(ClientOp::Ping).await.expect("ping");

    match client_rx.next().await.expect("msg").expect("decode") {
        ServerOp::Msg {
            subject,
            payload: body,
            ..
        } => {
            assert_eq!(subject, "bulk.data");
            assert_eq!(body.as_ref(), payload.as_slice());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        client_rx.next().await.expect("pong").expect("decode"),
        ServerOp::Pong
    );

    drop(client_tx);
    drop(client_rx);
    let received = server.await.expect("server task");
    assert_eq!(received.len(), 3);
    assert!(matches!(
        &received[0],
        ClientOp::Connect(info) if info.auth_token.as_deref() == Some("s3cr3t")
    ));
}

#[tokio::test]
async fn oversized_publish_surfaces_as_stream_error() {
    let (client_io, server_io) = tokio::io::duplex(256);
    let mut client_tx = FramedWrite::new(client_io, ClientCodec::new(MAX_PAYLOAD));
    let mut server_rx = FramedRead::new(server_io, ServerCodec::new(8));

    client_tx
        .send(ClientOp::Pub {
            subject: "a".to_string(),
            reply: None,
            payload: vec![0u8; 9].into(),
        })
        .await
        .expect("pub");

    let err = server_rx
        .next()
        .await
        .expect("frame")
        .expect_err("oversized");
    assert_eq!(err.protocol_text(), "Maximum Payload Violation");
}
