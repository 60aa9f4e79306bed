use comms::{
    msg::{Command, Msg, Payload},
    specs::{AugmentParams, Link, MinibatchRequest, Role},
};
use tokio::io;

#[tokio::test]
async fn control_messages_keep_send_order() -> io::Result<()> {
    let (one, two) = io::duplex(1024);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    let req = MinibatchRequest {
        files: vec!["0.safetensors".into()],
        params: AugmentParams::CENTER,
        role: Role::Query,
    };

    tx.send(&Msg::Control(Command::Hello(Link::LoadRequest))).await?;
    tx.send(&Msg::Control(Command::Load(req.clone()))).await?;
    tx.send(&Msg::Control(Command::CalcFinished)).await?;

    let mut buf: Vec<u32> = Vec::new();
    let Msg::Control(Command::Hello(link)) = rx.recv_into(&mut buf).await? else {
        panic!("expected hello");
    };
    assert_eq!(link, Link::LoadRequest);

    let Msg::Control(Command::Load(got)) = rx.recv_into(&mut buf).await? else {
        panic!("expected load");
    };
    assert_eq!(got, req);

    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert!(matches!(msg, Msg::Control(Command::CalcFinished)));
    Ok(())
}

#[tokio::test]
async fn image_mean_payload_is_received_in_place() -> io::Result<()> {
    let (one, two) = io::duplex(4096);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    let mean = [0.5f32, 1.5, 2.5];
    tx.send(&Msg::Data(Payload::ImageMean(&mean))).await?;

    let mut buf: Vec<f32> = Vec::new();
    let Msg::Data(Payload::ImageMean(got)) = rx.recv_into(&mut buf).await? else {
        panic!("expected image mean");
    };
    assert_eq!(got, &mean);
    Ok(())
}

#[tokio::test]
async fn closed_peer_surfaces_as_eof() {
    let (one, two) = io::duplex(64);
    drop(one);
    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}
