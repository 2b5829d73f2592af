//! Confirms the composer's wire output actually parses as IMAP,
//! rather than merely matching hand-written byte expectations. Uses
//! `imap-codec`'s independent parser as ground truth, the same crate
//! `duesee-imap-codec`'s own examples (`parse_greeting.rs`,
//! `parse_response.rs`) use to validate greeting/response bytes.

use imap_codec::decode::Decoder;
use imap_codec::{GreetingCodec, ResponseCodec};
use imap_core::{Attribute, Composer, ResponseRecord};

async fn composed_bytes(record: ResponseRecord) -> Vec<u8> {
    let (mut reader, writer) = tokio::io::duplex(4096);
    let mut egress = imap_core::EgressPipeline::plain(writer);
    Composer::write(&mut egress, record).await.unwrap();
    drop(egress);

    let mut buf = Vec::new();
    use tokio::io::AsyncReadExt;
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn greeting_round_trips_through_an_independent_parser() {
    let greeting = ResponseRecord::untagged("OK", vec![Attribute::Atom("imap-core ready".into())]);
    let bytes = composed_bytes(greeting).await;

    let (remaining, _parsed) = GreetingCodec::default()
        .decode(&bytes)
        .expect("composer output must be a valid IMAP greeting");
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn tagged_ok_response_round_trips_through_an_independent_parser() {
    let response = ResponseRecord::tagged("a1", "OK", vec![Attribute::Atom("LOGOUT completed".into())]);
    let bytes = composed_bytes(response).await;

    let (remaining, _parsed) = ResponseCodec::default()
        .decode(&bytes)
        .expect("composer output must be a valid IMAP response");
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn untagged_exists_round_trips_through_an_independent_parser() {
    let response = ResponseRecord::untagged("5", vec![Attribute::Atom("EXISTS".into())]);
    let bytes = composed_bytes(response).await;

    let (remaining, _parsed) = ResponseCodec::default()
        .decode(&bytes)
        .expect("composer output must be a valid IMAP response");
    assert!(remaining.is_empty());
}
