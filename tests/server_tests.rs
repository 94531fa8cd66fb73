#[cfg(test)]
mod integration_tests {
    use std::fs;
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    use mio::Poll;
    use origin_server::config::{AppConfig, ProxyRule, ServerConfig};
    use origin_server::server::Server;

    fn start_server(config: AppConfig) {
        thread::spawn(move || {
            let poll = Poll::new().unwrap();
            let mut server = Server::new(config, &poll).unwrap();
            server.run(poll).unwrap();
        });
        thread::sleep(Duration::from_millis(300));
    }

    fn static_config(port: u16, root: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.servers.push(ServerConfig {
            listen: port,
            root: root.into(),
            default_server: true,
            ..Default::default()
        });
        config
    }

    fn setup_root(root: &str, body: &str) {
        let _ = fs::remove_dir_all(root);
        fs::create_dir_all(root).unwrap();
        fs::write(format!("{}/index.html", root), body).unwrap();
    }

    /// Read one full response: headers, then Content-Length body bytes.
    fn read_response(stream: &mut TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let header_end = data.windows(4).position(|w| w == b"\r\n\r\n");
            if let Some(end) = header_end {
                let headers = String::from_utf8_lossy(&data[..end]).to_string();
                let content_length = headers
                    .lines()
                    .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                    .and_then(|l| l.split(':').nth(1))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + content_length {
                    return String::from_utf8_lossy(&data[..end + 4 + content_length])
                        .to_string();
                }
            }
            match stream.read(&mut chunk) {
                Ok(0) => return String::from_utf8_lossy(&data).to_string(),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    #[test]
    fn test_static_get_keep_alive() {
        let root = "./tmp_it_static";
        setup_root(root, "hi\n");
        start_server(static_config(18080, root));

        let mut stream = TcpStream::connect("127.0.0.1:18080").unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
        assert!(response.contains("Content-Length: 3\r\n"));
        assert!(response.contains("Content-Type: text/html\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.contains("Date: "));
        assert!(response.contains("Last-Modified: "));
        assert!(response.ends_with("\r\n\r\nhi\n"));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_traversal_is_rejected() {
        let root = "./tmp_it_traversal";
        setup_root(root, "hi\n");
        start_server(static_config(18081, root));

        let mut stream = TcpStream::connect("127.0.0.1:18081").unwrap();
        stream
            .write_all(b"GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.ends_with("Bad Request"));

        // The server closes after an error response.
        let mut probe = [0u8; 16];
        assert_eq!(stream.read(&mut probe).unwrap(), 0);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_encoded_traversal_is_rejected() {
        let root = "./tmp_it_enc_traversal";
        setup_root(root, "hi\n");
        start_server(static_config(18082, root));

        let mut stream = TcpStream::connect("127.0.0.1:18082").unwrap();
        stream
            .write_all(b"GET /..%2fetc/passwd HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 400 "));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_pipelined_requests() {
        let root = "./tmp_it_pipeline";
        setup_root(root, "hello");
        start_server(static_config(18083, root));

        let mut stream = TcpStream::connect("127.0.0.1:18083").unwrap();
        stream
            .write_all(
                b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
            )
            .unwrap();

        let first = read_response(&mut stream);
        assert!(first.starts_with("HTTP/1.1 200 OK"), "{}", first);
        let second = read_response(&mut stream);
        assert!(second.starts_with("HTTP/1.1 200 OK"), "{}", second);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_keep_alive_sequential_requests() {
        let root = "./tmp_it_keepalive";
        setup_root(root, "again");
        start_server(static_config(18084, root));

        let mut stream = TcpStream::connect("127.0.0.1:18084").unwrap();
        for _ in 0..3 {
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .unwrap();
            let response = read_response(&mut stream);
            assert!(response.starts_with("HTTP/1.1 200 OK"));
            assert!(response.ends_with("again"));
        }

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_oversized_body_is_rejected_before_upload() {
        let root = "./tmp_it_payload";
        setup_root(root, "hi\n");
        let mut config = static_config(18085, root);
        config.servers[0].allowed_methods = vec!["GET".to_string(), "POST".to_string()];
        config.servers[0].max_body_bytes = 64;
        start_server(config);

        let mut stream = TcpStream::connect("127.0.0.1:18085").unwrap();
        // Headers only; the 413 must arrive before any body bytes are sent.
        stream
            .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 65\r\n\r\n")
            .unwrap();

        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 413 "), "{}", response);
        assert!(response.contains("Connection: close\r\n"));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_oversized_header_block() {
        let root = "./tmp_it_431";
        setup_root(root, "hi\n");
        let mut config = static_config(18086, root);
        config.servers[0].max_header_bytes = 256;
        start_server(config);

        let mut stream = TcpStream::connect("127.0.0.1:18086").unwrap();
        let mut raw = b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ".to_vec();
        raw.extend_from_slice(&vec![b'a'; 512]);
        raw.extend_from_slice(b"\r\n\r\n");
        stream.write_all(&raw).unwrap();

        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 431 "), "{}", response);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_method_not_in_allow_list() {
        let root = "./tmp_it_405";
        setup_root(root, "hi\n");
        start_server(static_config(18087, root));

        let mut stream = TcpStream::connect("127.0.0.1:18087").unwrap();
        stream
            .write_all(b"DELETE / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 405 "), "{}", response);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_missing_file_is_404() {
        let root = "./tmp_it_404";
        setup_root(root, "hi\n");
        start_server(static_config(18088, root));

        let mut stream = TcpStream::connect("127.0.0.1:18088").unwrap();
        stream
            .write_all(b"GET /nothing.here HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 404 "), "{}", response);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_idle_connection_is_evicted() {
        let root = "./tmp_it_idle";
        setup_root(root, "hi\n");
        let mut config = static_config(18089, root);
        config.servers[0].idle_timeout_seconds = 1;
        start_server(config);

        let mut stream = TcpStream::connect("127.0.0.1:18089").unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 200 OK"));

        // Sit idle past the deadline; the server must close the socket.
        stream
            .set_read_timeout(Some(Duration::from_secs(4)))
            .unwrap();
        let mut probe = [0u8; 16];
        match stream.read(&mut probe) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {} bytes while idle", n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                panic!("connection was not closed after the idle timeout")
            }
            Err(e) => panic!("read failed: {}", e),
        }

        let _ = fs::remove_dir_all(root);
    }

    /// Minimal backend that echoes the request body back with a 200.
    fn spawn_echo_upstream(port: u16) {
        thread::spawn(move || {
            let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut data = Vec::new();
                let mut chunk = [0u8; 4096];
                let body_start = loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => break None,
                        Ok(n) => {
                            data.extend_from_slice(&chunk[..n]);
                            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                                break Some(pos + 4);
                            }
                        }
                        Err(_) => break None,
                    }
                };
                let Some(body_start) = body_start else { continue };
                let headers = String::from_utf8_lossy(&data[..body_start]).to_string();
                let content_length = headers
                    .lines()
                    .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                    .and_then(|l| l.split(':').nth(1))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while data.len() < body_start + content_length {
                    match stream.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => data.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    }
                }
                let body = &data[body_start..];
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(body);
            }
        });
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn test_proxy_echo_round_trip() {
        let root = "./tmp_it_proxy";
        setup_root(root, "hi\n");
        spawn_echo_upstream(19090);

        let mut config = static_config(18090, root);
        config.servers[0].allowed_methods = vec!["GET".to_string(), "POST".to_string()];
        config.servers[0].proxies = vec![ProxyRule {
            prefix: "/echo".to_string(),
            upstream: "http://127.0.0.1:19090".to_string(),
            strip_prefix: false,
            target: None,
        }];
        config.resolve_upstreams().unwrap();
        start_server(config);

        let mut stream = TcpStream::connect("127.0.0.1:18090").unwrap();
        stream
            .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();

        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.ends_with("hello"), "{}", response);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_unreachable_upstream_is_502() {
        let root = "./tmp_it_502";
        setup_root(root, "hi\n");
        let mut config = static_config(18091, root);
        // Nothing listens on this port; the non-blocking connect must
        // surface as a 502 before any response bytes.
        config.servers[0].proxies = vec![ProxyRule {
            prefix: "/api".to_string(),
            upstream: "http://127.0.0.1:19991".to_string(),
            strip_prefix: false,
            target: None,
        }];
        config.resolve_upstreams().unwrap();
        start_server(config);

        let mut stream = TcpStream::connect("127.0.0.1:18091").unwrap();
        stream
            .write_all(b"GET /api/things HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 502 "), "{}", response);
        assert!(response.contains("Connection: close\r\n"));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_head_has_headers_but_no_body() {
        let root = "./tmp_it_head";
        setup_root(root, "hi\n");
        start_server(static_config(18092, root));

        let mut stream = TcpStream::connect("127.0.0.1:18092").unwrap();
        stream
            .write_all(b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        let response = String::from_utf8_lossy(&data);
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.contains("Content-Length: 3\r\n"));
        assert!(response.ends_with("\r\n\r\n"), "body must be suppressed");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_many_concurrent_keep_alive_clients() {
        let root = "./tmp_it_concurrent";
        setup_root(root, "small");
        start_server(static_config(18093, root));

        let mut handles = Vec::new();
        for _ in 0..50 {
            handles.push(thread::spawn(|| {
                let mut stream = TcpStream::connect("127.0.0.1:18093").unwrap();
                stream
                    .write_all(
                        b"GET / HTTP/1.1\r\nHost: x\r\n\r\n\
                          GET / HTTP/1.1\r\nHost: x\r\n\r\n",
                    )
                    .unwrap();
                let first = read_response(&mut stream);
                let second = read_response(&mut stream);
                assert!(first.starts_with("HTTP/1.1 200 OK"));
                assert!(second.starts_with("HTTP/1.1 200 OK"));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let _ = fs::remove_dir_all(root);
    }
}
