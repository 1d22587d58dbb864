//! Content-Length フレーミング越しのエンドツーエンドテスト

use anyhow::Result;
use messenger_rpc::rpc::stdio::{encode_frame, read_frame};
use messenger_rpc::{
    CallError, CallInfo, Envelope, FrameConfig, FramedTransport, Messenger, MessengerConfig,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn framed_pair() -> (FramedTransport, FramedTransport) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        FramedTransport::new(left_read, left_write, FrameConfig::default()),
        FramedTransport::new(right_read, right_write, FrameConfig::default()),
    )
}

#[tokio::test]
async fn test_call_over_framed_streams() -> Result<()> {
    let (left, right) = framed_pair();
    let server = Messenger::new(left, MessengerConfig::default())?;
    let client = Messenger::new(right, MessengerConfig::default())?;

    server.register_sync("lines", |args, _| {
        let text = args.as_str().unwrap_or_default();
        Ok(json!(text.lines().count()))
    })?;
    server.register_async("upper", |args: Value, _info: CallInfo| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(json!(args.as_str().unwrap_or_default().to_uppercase()))
    })?;

    let count = timeout(WAIT, client.call("lines", json!("a\nb\r\nc"))).await??;
    assert_eq!(count, json!(3));

    let upper = timeout(WAIT, client.call("upper", json!("ünïcode"))).await??;
    assert_eq!(upper, json!("ÜNÏCODE"));
    Ok(())
}

#[tokio::test]
async fn test_raw_peer_speaks_wire_format() -> Result<()> {
    // 片側は素のストリームで、既存のメッセンジャー実装と同じ JSON を手で書く
    let (engine_side, mut peer) = tokio::io::duplex(64 * 1024);
    let (engine_read, engine_write) = tokio::io::split(engine_side);
    let transport = FramedTransport::new(engine_read, engine_write, FrameConfig::default());
    let messenger = Messenger::new(transport, MessengerConfig::default())?;
    messenger.register_sync("execLS", |args, _| Ok(json!(format!("listing {}", args))))?;

    let request = r#"{"callNumber":7,"type":"execLS","data":"/tmp","resolved":true,"action":"execute"}"#;
    peer.write_all(encode_frame(request).as_bytes()).await?;

    let mut reader = BufReader::new(peer);
    let body = timeout(WAIT, read_frame(&mut reader, &FrameConfig::default()))
        .await??
        .expect("framed reply");

    let reply = Envelope::decode(&body)?;
    assert_eq!(reply.name, "execLS$7");
    assert_eq!(reply.sequence_number, 7);
    assert!(reply.succeeded);
    assert_eq!(reply.payload, json!("listing \"/tmp\""));
    Ok(())
}

#[tokio::test]
async fn test_peer_disconnect_leaves_call_pending_until_timeout() -> Result<()> {
    let (engine_side, peer) = tokio::io::duplex(1024);
    let (engine_read, engine_write) = tokio::io::split(engine_side);
    let transport = FramedTransport::new(engine_read, engine_write, FrameConfig::default());
    let config = MessengerConfig::default().with_call_timeout(Duration::from_millis(30));
    let messenger = Messenger::new(transport, config)?;

    drop(peer);

    let result = timeout(WAIT, messenger.call("anyone", Value::Null)).await?;
    assert!(matches!(result, Err(CallError::Timeout { .. })));
    Ok(())
}
