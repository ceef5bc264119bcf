//! The Info protocol: a request is a newline-joined list of command names; the
//! response pairs each name with its value, tab-separated, newline-terminated.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ClientError, Result};

/// Sends an info request over an already-connected stream and returns the
/// parsed `name -> value` pairs.
///
/// Wire format: the request body is `name[\nname]*` preceded by
/// an 8-byte big-endian length/version header; the response uses the same
/// header followed by `name\tvalue\n` records.
pub struct InfoClient;

const HEADER_LEN: usize = 8;
const VERSION: u8 = 2;
const TYPE_INFO: u8 = 1;

impl InfoClient {
    /// Issues `names` as a single info request and returns the response as
    /// ordered `(name, value)` pairs.
    pub async fn request(
        stream: &mut TcpStream,
        names: &[&str],
        timeout: Duration,
    ) -> Result<Vec<(String, String)>> {
        let body = names.join("\n");
        let frame = encode_frame(body.as_bytes());

        tokio::time::timeout(timeout, stream.write_all(&frame))
            .await
            .map_err(|_| ClientError::Timeout)??;

        let response = tokio::time::timeout(timeout, read_frame(stream))
            .await
            .map_err(|_| ClientError::Timeout)??;

        parse_response(&response)
    }
}

fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut header = [0u8; HEADER_LEN];
    let sz = body.len() as u64 & 0x0000_FFFF_FFFF_FFFF;
    let sized = sz | ((VERSION as u64) << 56) | ((TYPE_INFO as u64) << 48);
    header.copy_from_slice(&sized.to_be_bytes());
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(body);
    frame
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let sized = u64::from_be_bytes(header);
    let len = (sized & 0x0000_FFFF_FFFF_FFFF) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

fn parse_response(body: &[u8]) -> Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ClientError::ParseError(format!("info response not utf-8: {e}")))?;

    let mut pairs = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((name, value)) => pairs.push((name.to_string(), value.to_string())),
            None => pairs.push((line.to_string(), String::new())),
        }
    }
    Ok(pairs)
}

/// Rejects a namespace name over the protocol's 30-byte limit before it is
/// ever placed on the wire.
pub fn check_namespace_len(namespace: &str, max_len: usize) -> Result<()> {
    if namespace.len() > max_len {
        return Err(ClientError::ParseError(format!(
            "namespace '{namespace}' exceeds {max_len} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_frame_roundtrips_through_parse() {
        let frame = encode_frame(b"node\npartition-generation");
        let sized = u64::from_be_bytes(frame[..HEADER_LEN].try_into().unwrap());
        let len = (sized & 0x0000_FFFF_FFFF_FFFF) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
    }

    #[test]
    fn parse_response_splits_name_value_pairs() {
        let body = b"node\tBB9020011AC4202\npartition-generation\t7\n";
        let pairs = parse_response(body).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("node".to_string(), "BB9020011AC4202".to_string()),
                ("partition-generation".to_string(), "7".to_string()),
            ]
        );
    }

    #[test]
    fn parse_response_handles_valueless_name() {
        let body = b"services\n";
        let pairs = parse_response(body).unwrap();
        assert_eq!(pairs, vec![("services".to_string(), String::new())]);
    }

    #[test]
    fn check_namespace_len_rejects_oversized() {
        let long = "x".repeat(31);
        assert!(check_namespace_len(&long, 30).is_err());
        assert!(check_namespace_len("test", 30).is_ok());
    }

    #[tokio::test]
    async fn request_round_trips_over_real_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut header = [0u8; HEADER_LEN];
            sock.read_exact(&mut header).await.unwrap();
            let sized = u64::from_be_bytes(header);
            let len = (sized & 0x0000_FFFF_FFFF_FFFF) as usize;
            let mut body = vec![0u8; len];
            sock.read_exact(&mut body).await.unwrap();
            assert_eq!(body, b"node");

            let reply = encode_frame(b"node\tBB9020011AC4202\n");
            sock.write_all(&reply).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let pairs = InfoClient::request(&mut client, &["node"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pairs, vec![("node".to_string(), "BB9020011AC4202".to_string())]);
        server.await.unwrap();
    }
}
