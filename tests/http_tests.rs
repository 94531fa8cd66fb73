use origin_server::http::*;

fn parse(raw: &[u8], max_header: usize) -> Result<ParsingState, ParseError> {
    let mut req = HttpRequest::new();
    req.buffer.extend_from_slice(raw);
    req.advance_headers(max_header)
}

#[test]
fn test_simple_get_request() {
    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");

    let state = req.advance_headers(8192).unwrap();

    assert_eq!(state, ParsingState::HeadersDone);
    assert_eq!(req.method, Method::GET);
    assert_eq!(req.path, "/index.html");
    assert_eq!(req.version, Version::Http11);
    assert_eq!(req.headers.get("Host"), Some("localhost"));
    assert!(req.keep_alive);
    assert!(req.buffer.is_empty());
}

#[test]
fn test_fragmented_headers() {
    let mut req = HttpRequest::new();

    req.buffer.extend_from_slice(b"GET /path ");
    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::Headers);

    req.buffer.extend_from_slice(b"HTTP/1.1\r\nHost: x\r\n");
    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::Headers);

    req.buffer.extend_from_slice(b"User-Agent: test\r\n\r\n");
    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::HeadersDone);
    assert_eq!(req.headers.get("user-agent"), Some("test"));
}

#[test]
fn test_post_body_phases() {
    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhel");

    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::HeadersDone);
    assert_eq!(req.content_length, 5);

    // Bytes already past the terminator are consumed as soon as the body
    // phase starts.
    req.begin_body();
    assert_eq!(req.body_received, 3);
    assert!(!req.drain_body_bytes());

    req.buffer.extend_from_slice(b"lo");
    assert!(req.drain_body_bytes());
    assert_eq!(req.body, b"hello");
    assert_eq!(req.state, ParsingState::Complete);
}

#[test]
fn test_unknown_method_token() {
    let err = parse(b"FETCH / HTTP/1.1\r\nHost: x\r\n\r\n", 8192).unwrap_err();
    assert_eq!(err.status(), 400);
}

#[test]
fn test_recognized_method_parses() {
    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"DELETE /thing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::HeadersDone);
    assert_eq!(req.method, Method::DELETE);
}

#[test]
fn test_lowercase_method_is_rejected() {
    let err = parse(b"get / HTTP/1.1\r\nHost: x\r\n\r\n", 8192).unwrap_err();
    assert_eq!(err.status(), 400);
}

#[test]
fn test_malformed_request_line() {
    let err = parse(b"GET /\r\nHost: x\r\n\r\n", 8192).unwrap_err();
    assert_eq!(err.status(), 400);
}

#[test]
fn test_unsupported_version() {
    let err = parse(b"GET / HTTP/2.0\r\nHost: x\r\n\r\n", 8192).unwrap_err();
    assert_eq!(err, ParseError::VersionNotSupported);
    assert_eq!(err.status(), 505);
}

#[test]
fn test_missing_host_http11() {
    let err = parse(b"GET / HTTP/1.1\r\n\r\n", 8192).unwrap_err();
    assert_eq!(err.status(), 400);
}

#[test]
fn test_missing_host_http10_is_fine() {
    let mut req = HttpRequest::new();
    req.buffer.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::HeadersDone);
    assert!(!req.keep_alive);
}

#[test]
fn test_keep_alive_defaults_and_overrides() {
    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    req.advance_headers(8192).unwrap();
    assert!(!req.keep_alive);

    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    req.advance_headers(8192).unwrap();
    assert!(req.keep_alive);
}

#[test]
fn test_repeated_headers() {
    let mut req = HttpRequest::new();
    req.buffer.extend_from_slice(
        b"GET / HTTP/1.1\r\nHost: first\r\nHost: second\r\nAccept: a\r\nAccept: b\r\n\r\n",
    );
    req.advance_headers(8192).unwrap();

    // Single-valued headers keep the first occurrence; list-valued ones
    // are folded together.
    assert_eq!(req.headers.get("host"), Some("first"));
    assert_eq!(req.headers.get("accept"), Some("a, b"));
}

#[test]
fn test_bad_content_length() {
    let err = parse(
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: ten\r\n\r\n",
        8192,
    )
    .unwrap_err();
    assert_eq!(err.status(), 400);
}

#[test]
fn test_chunked_transfer_encoding_unsupported() {
    let err = parse(
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
        8192,
    )
    .unwrap_err();
    assert_eq!(err, ParseError::ChunkedBodyUnsupported);
    assert_eq!(err.status(), 501);
}

#[test]
fn test_header_block_size_boundary() {
    let mut raw = b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ".to_vec();
    raw.extend_from_slice(&vec![b'a'; 100]);
    raw.extend_from_slice(b"\r\n\r\n");

    // A block exactly at the limit is accepted.
    assert_eq!(
        parse(&raw, raw.len()).unwrap(),
        ParsingState::HeadersDone
    );
    // One byte over is rejected with 431.
    let err = parse(&raw, raw.len() - 1).unwrap_err();
    assert_eq!(err, ParseError::HeaderBlockTooLarge);
    assert_eq!(err.status(), 431);
}

#[test]
fn test_oversized_block_without_terminator() {
    let mut raw = b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ".to_vec();
    raw.extend_from_slice(&vec![b'a'; 300]);
    let err = parse(&raw, 64).unwrap_err();
    assert_eq!(err, ParseError::HeaderBlockTooLarge);
}

#[test]
fn test_pipelined_residual_stays_buffered() {
    let mut req = HttpRequest::new();
    req.buffer.extend_from_slice(
        b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::HeadersDone);
    assert_eq!(req.path, "/a");
    assert_eq!(req.buffer, b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n");

    // The residual parses as the next request after a reset.
    req.reset();
    assert_eq!(req.advance_headers(8192).unwrap(), ParsingState::HeadersDone);
    assert_eq!(req.path, "/b");
}

#[test]
fn test_query_split() {
    let mut req = HttpRequest::new();
    req.buffer
        .extend_from_slice(b"GET /search?q=rust&x=1 HTTP/1.1\r\nHost: x\r\n\r\n");
    req.advance_headers(8192).unwrap();
    assert_eq!(req.path, "/search");
    assert_eq!(req.query.as_deref(), Some("q=rust&x=1"));
}

mod path_normalization {
    use super::*;

    #[test]
    fn resolves_dot_segments() {
        assert_eq!(normalize_path("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_path("/a/./b").unwrap(), "/a/b");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/a/..").unwrap(), "/");
    }

    #[test]
    fn collapses_duplicate_slashes() {
        assert_eq!(normalize_path("/a//b///c").unwrap(), "/a/b/c");
    }

    #[test]
    fn preserves_trailing_slash_intent() {
        assert_eq!(normalize_path("/dir/").unwrap(), "/dir/");
        assert_eq!(normalize_path("/dir").unwrap(), "/dir");
    }

    #[test]
    fn rejects_traversal_above_root() {
        assert!(normalize_path("/../etc/passwd").is_err());
        assert!(normalize_path("/a/../../etc").is_err());
    }

    #[test]
    fn rejects_encoded_traversal() {
        // `..%2f` decodes to `../` and must not survive normalization.
        assert!(normalize_path("/..%2fetc/passwd").is_err());
        assert!(normalize_path("/%2e%2e/etc").is_err());
    }

    #[test]
    fn decodes_percent_escapes() {
        assert_eq!(normalize_path("/with%20space").unwrap(), "/with space");
    }

    #[test]
    fn rejects_bad_escapes() {
        assert!(normalize_path("/bad%zz").is_err());
        assert!(normalize_path("/trunc%2").is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["/a/b/../c", "/a//b/", "/x/./y", "/plain"] {
            let once = normalize_path(raw).unwrap();
            assert_eq!(normalize_path(&once).unwrap(), once);
        }
    }
}
