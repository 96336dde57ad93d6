//! End-to-end scenarios over an in-memory transport (spec §8 "End-to-end
//! scenarios"), using `tokio::io::duplex` the way the teacher crate's own
//! tests stand in for a real FastCGI application socket.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use fcgi_dispatch::backend::Backend;
use fcgi_dispatch::config::FcgiAppConfig;
use fcgi_dispatch::dispatch::Dispatcher;
use fcgi_dispatch::htx::{Htx, HtxBlock};
use fcgi_dispatch::lb::fwrr;
use fcgi_dispatch::record::{self, Header, ProtocolStatus, RequestType};
use fcgi_dispatch::transport::TokioTransport;

async fn read_record(sock: &mut (impl tokio::io::AsyncRead + Unpin)) -> (Header, Vec<u8>) {
    let mut hdr_buf = [0u8; 8];
    sock.read_exact(&mut hdr_buf).await.unwrap();
    let header = Header::decode(&hdr_buf);
    let mut content = vec![0u8; header.content_length as usize];
    sock.read_exact(&mut content).await.unwrap();
    let mut padding = vec![0u8; header.padding_length as usize];
    sock.read_exact(&mut padding).await.unwrap();
    (header, content)
}

fn encode_end_request(out: &mut Vec<u8>, id: u16, app_status: u32, status: ProtocolStatus) {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&app_status.to_be_bytes());
    body.push(status as u8);
    body.extend_from_slice(&[0, 0, 0]);
    record::encode_record(out, RequestType::EndRequest, id, &body);
}

fn one_server_backend() -> (Arc<Backend>, fcgi_dispatch::server::ServerId) {
    let mut backend = Backend::new(1, false);
    let sid = backend.add_server("app", 10, false);
    fwrr::set_server_status_up(&backend, sid);
    backend.servers[sid.0].maxconn = 10;
    backend.servers[sid.0].minconn = 10;
    (Arc::new(backend), sid)
}

fn simple_get_request() -> Htx {
    let mut request = Htx::new();
    request.push(HtxBlock::StartLine { method: Method::GET, target: "/a".to_string(), version: Version::HTTP_11 });
    request.push(HtxBlock::Header { name: "host".to_string(), value: "h".to_string() });
    request.push(HtxBlock::EndOfHeaders);
    request.push(HtxBlock::EndOfMessage);
    request
}

#[tokio::test]
async fn simple_get_end_to_end() {
    let (backend, sid) = one_server_backend();
    let (mut app_side, proxy_side) = tokio::io::duplex(8192);

    let config = Arc::new(FcgiAppConfig::minimal("/var/www"));
    let mut dispatcher = Dispatcher::new(backend, config, 0);
    dispatcher.register_connection(sid, TokioTransport::new(proxy_side), Duration::from_secs(30));

    let app_task = tokio::spawn(async move {
        let (begin_hdr, begin_body) = read_record(&mut app_side).await;
        assert_eq!(begin_hdr.request_id, 1);
        assert!(matches!(begin_hdr.r#type, RequestType::BeginRequest));
        assert_eq!(&begin_body[0..2], &1u16.to_be_bytes()[..]); // role = RESPONDER
        assert_eq!(begin_body[2] & 1, 1); // KEEP_CONN

        let (params_hdr, params_body) = read_record(&mut app_side).await;
        assert!(matches!(params_hdr.r#type, RequestType::Params));
        let pairs = record::decode_params(&params_body).unwrap();
        let get = |k: &str| pairs.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());
        assert_eq!(get("GATEWAY_INTERFACE").as_deref(), Some("CGI/1.1"));
        assert_eq!(get("REQUEST_METHOD").as_deref(), Some("GET"));
        assert_eq!(get("REQUEST_URI").as_deref(), Some("/a"));
        assert_eq!(get("SERVER_PROTOCOL").as_deref(), Some("HTTP/1.1"));
        assert_eq!(get("HTTP_HOST").as_deref(), Some("h"));
        assert_eq!(get("CONTENT_LENGTH").as_deref(), Some("0"));
        assert_eq!(get("SCRIPT_NAME").as_deref(), Some("/a"));

        let (empty_params_hdr, empty_params_body) = read_record(&mut app_side).await;
        assert!(matches!(empty_params_hdr.r#type, RequestType::Params));
        assert!(empty_params_body.is_empty());

        let (stdin_hdr, stdin_body) = read_record(&mut app_side).await;
        assert!(matches!(stdin_hdr.r#type, RequestType::Stdin));
        assert!(stdin_body.is_empty());

        let mut out = Vec::new();
        record::encode_record(&mut out, RequestType::Stdout, 1, b"200 OK\r\nContent-Length: 3\r\n\r\nabc");
        record::encode_record(&mut out, RequestType::Stdout, 1, &[]);
        encode_end_request(&mut out, 1, 0, ProtocolStatus::RequestComplete);
        app_side.write_all(&out).await.unwrap();
    });

    let response = dispatcher.dispatch(simple_get_request(), "127.0.0.1", 4242, 80, false).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Bytes::from_static(b"abc"));

    app_task.await.unwrap();
}

#[tokio::test]
async fn multiplexing_rejected_forces_streams_limit_to_one() {
    let (backend, sid) = one_server_backend();
    let (mut app_side, proxy_side) = tokio::io::duplex(8192);

    let mut config = FcgiAppConfig::minimal("/var/www");
    config.get_values_supported = true;
    let config = Arc::new(config);
    let mut dispatcher = Dispatcher::new(backend, config, 0);
    dispatcher.register_connection(sid, TokioTransport::new(proxy_side), Duration::from_secs(30));

    let app_task = tokio::spawn(async move {
        let (gv_hdr, _) = read_record(&mut app_side).await;
        assert!(matches!(gv_hdr.r#type, RequestType::GetValues));

        let mut gvr = Vec::new();
        record::encode_params(&mut gvr, [("FCGI_MAX_REQS", "50"), ("FCGI_MPXS_CONNS", "0")]);
        let mut out = Vec::new();
        record::encode_record(&mut out, RequestType::GetValuesResult, 0, &gvr);
        app_side.write_all(&out).await.unwrap();

        let (begin_hdr, begin_body) = read_record(&mut app_side).await;
        assert!(matches!(begin_hdr.r#type, RequestType::BeginRequest));
        assert_eq!(begin_body[2] & 1, 1);
        let (_params_hdr, _) = read_record(&mut app_side).await;
        let (_empty_params_hdr, _) = read_record(&mut app_side).await;
        let (_stdin_hdr, _) = read_record(&mut app_side).await;

        let mut out = Vec::new();
        record::encode_record(&mut out, RequestType::Stdout, 1, b"200 OK\r\n\r\n");
        record::encode_record(&mut out, RequestType::Stdout, 1, &[]);
        encode_end_request(&mut out, 1, 0, ProtocolStatus::RequestComplete);
        app_side.write_all(&out).await.unwrap();
    });

    let response = dispatcher.dispatch(simple_get_request(), "127.0.0.1", 1, 80, false).await.unwrap();
    assert_eq!(response.status, 200);

    app_task.await.unwrap();
}
