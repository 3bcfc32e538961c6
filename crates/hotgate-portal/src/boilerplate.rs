use crate::http::{HttpPetition, HttpResponse, Method};

/// Canned replies for requests browsers make on their own.
pub fn respond(req: &HttpPetition) -> Option<HttpResponse> {
    if req.method == Method::Options {
        return Some(
            HttpResponse::no_content()
                .with_header("Access-Control-Allow-Origin", "*")
                .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .with_header("Access-Control-Allow-Headers", "Content-Type")
                .with_header("Access-Control-Max-Age", "86400"),
        );
    }

    let path = req.path.to_ascii_lowercase();
    match path.as_str() {
        "/favicon.ico" => Some(HttpResponse::no_content()),
        "/robots.txt" => Some(HttpResponse::text(200, "User-agent: *\nDisallow: /\n")),
        "/manifest.json" | "/site.webmanifest" => Some(
            HttpResponse::new(200)
                .with_header("Content-Type", "application/manifest+json")
                .with_body(b"{}".to_vec()),
        ),
        p if p.starts_with("/apple-touch-icon") => Some(HttpResponse::no_content()),
        p if p.starts_with("/.well-known/") => Some(HttpResponse::text(404, "Not Found")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(raw: &str) -> HttpPetition {
        HttpPetition::parse(raw.as_bytes(), "10.0.0.5".parse().unwrap()).unwrap()
    }

    #[test]
    fn canned_paths() {
        assert_eq!(respond(&req("GET /favicon.ico HTTP/1.1\r\n\r\n")).unwrap().status, 204);
        let robots = respond(&req("GET /robots.txt HTTP/1.1\r\n\r\n")).unwrap();
        assert_eq!(robots.body, b"User-agent: *\nDisallow: /\n");
        assert_eq!(
            respond(&req("GET /.well-known/change-password HTTP/1.1\r\n\r\n")).unwrap().status,
            404
        );
        assert_eq!(
            respond(&req("GET /apple-touch-icon-precomposed.png HTTP/1.1\r\n\r\n")).unwrap().status,
            204
        );
    }

    #[test]
    fn preflight_gets_cors_headers() {
        let resp = respond(&req("OPTIONS /portal/login HTTP/1.1\r\n\r\n")).unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(resp.header("Access-Control-Allow-Origin"), Some("*"));
    }

    #[test]
    fn portal_paths_fall_through() {
        assert!(respond(&req("GET /portal/login HTTP/1.1\r\n\r\n")).is_none());
        assert!(respond(&req("GET /generate_204 HTTP/1.1\r\n\r\n")).is_none());
    }
}
