//! Connectivity-check probe classification.
//!
//! Each OS decides "this network has internet" by fetching a well-known URL
//! and comparing the reply byte for byte. Classification only picks which
//! reply to send; it never grants anything.

use std::fmt;

use crate::http::{HttpPetition, HttpResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptivePortalType {
    Apple,
    Android,
    Windows,
    Firefox,
    Chrome,
    Ubuntu,
    Samsung,
    Xiaomi,
    Huawei,
    Amazon,
    Nintendo,
    PlayStation,
    Generic,
}

impl fmt::Display for CaptivePortalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const HOSTS: &[(&str, CaptivePortalType)] = &[
    ("captive.apple.com", CaptivePortalType::Apple),
    ("www.apple.com", CaptivePortalType::Apple),
    ("www.appleiphonecell.com", CaptivePortalType::Apple),
    ("www.itools.info", CaptivePortalType::Apple),
    ("www.ibook.info", CaptivePortalType::Apple),
    ("www.airport.us", CaptivePortalType::Apple),
    ("www.thinkdifferent.us", CaptivePortalType::Apple),
    ("connectivitycheck.gstatic.com", CaptivePortalType::Android),
    ("connectivitycheck.android.com", CaptivePortalType::Android),
    ("clients1.google.com", CaptivePortalType::Android),
    ("clients3.google.com", CaptivePortalType::Android),
    ("play.googleapis.com", CaptivePortalType::Android),
    ("www.google.com", CaptivePortalType::Chrome),
    ("www.gstatic.com", CaptivePortalType::Chrome),
    ("www.msftncsi.com", CaptivePortalType::Windows),
    ("www.msftconnecttest.com", CaptivePortalType::Windows),
    ("ipv6.msftconnecttest.com", CaptivePortalType::Windows),
    ("dns.msftncsi.com", CaptivePortalType::Windows),
    ("detectportal.firefox.com", CaptivePortalType::Firefox),
    ("connectivity-check.ubuntu.com", CaptivePortalType::Ubuntu),
    ("nmcheck.gnome.org", CaptivePortalType::Ubuntu),
    ("network-test.debian.org", CaptivePortalType::Ubuntu),
    ("connectivitycheck.samsung.com", CaptivePortalType::Samsung),
    ("connect.rom.miui.com", CaptivePortalType::Xiaomi),
    ("connectivitycheck.platform.hicloud.com", CaptivePortalType::Huawei),
    ("connectivitycheck.cbg-app.huawei.com", CaptivePortalType::Huawei),
    ("spectrum.s3.amazonaws.com", CaptivePortalType::Amazon),
    ("fireoscaptiveportal.com", CaptivePortalType::Amazon),
    ("ctest.cdn.nintendo.net", CaptivePortalType::Nintendo),
    ("conntest.nintendowifi.net", CaptivePortalType::Nintendo),
    ("nw.playstation.net", CaptivePortalType::PlayStation),
];

/// Path fragments that identify a probe even behind an unknown host.
const PATHS: &[(&str, CaptivePortalType)] = &[
    ("/hotspot-detect.html", CaptivePortalType::Apple),
    ("/library/test/success.html", CaptivePortalType::Apple),
    ("/generate_204", CaptivePortalType::Android),
    ("/gen_204", CaptivePortalType::Android),
    ("/ncsi.txt", CaptivePortalType::Windows),
    ("/connecttest.txt", CaptivePortalType::Windows),
    ("/redirect", CaptivePortalType::Windows),
    ("/canonical.html", CaptivePortalType::Firefox),
    ("/success.txt", CaptivePortalType::Firefox),
    ("/check_network_status.txt", CaptivePortalType::Ubuntu),
    ("/kindle-wifi/wifistub.html", CaptivePortalType::Amazon),
    ("/kindle-wifi/wifiredirect.html", CaptivePortalType::Amazon),
];

const GENERIC_HINTS: &[&str] = &["generate204", "connectivity", "captive", "hotspot", "ncsi", "success.txt"];

impl CaptivePortalType {
    /// Classifies a request as a probe, or `None` for ordinary traffic.
    pub fn detect(host: &str, path: &str) -> Option<Self> {
        let path = path.to_ascii_lowercase();

        if let Some(&(_, kind)) = HOSTS.iter().find(|(h, _)| *h == host) {
            // The Google hosts double as ordinary web hosts.
            if kind == CaptivePortalType::Chrome && !is_204_path(&path) {
                return None;
            }
            return Some(kind);
        }

        if let Some(&(_, kind)) = PATHS.iter().find(|(p, _)| path.ends_with(p)) {
            return Some(kind);
        }

        if GENERIC_HINTS.iter().any(|hint| path.contains(hint)) {
            return Some(CaptivePortalType::Generic);
        }
        None
    }

    pub fn detect_request(req: &HttpPetition) -> Option<Self> {
        Self::detect(&req.host, &req.path)
    }

    /// The reply this family expects when the network is open.
    pub fn success_response(&self, path: &str) -> HttpResponse {
        let path = path.to_ascii_lowercase();
        match self {
            CaptivePortalType::Apple => HttpResponse::html(
                200,
                "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>",
            ),
            CaptivePortalType::Windows if path.ends_with("connecttest.txt") => {
                HttpResponse::text(200, "Microsoft Connect Test")
            }
            CaptivePortalType::Windows if path.ends_with("/redirect") => HttpResponse::no_content(),
            CaptivePortalType::Windows => HttpResponse::text(200, "Microsoft NCSI"),
            CaptivePortalType::Firefox if path.ends_with("canonical.html") => HttpResponse::html(
                200,
                "<meta http-equiv=\"refresh\" content=\"0;url=https://support.mozilla.org/kb/captive-portal\"/>",
            ),
            CaptivePortalType::Firefox => HttpResponse::text(200, "success\n"),
            CaptivePortalType::Ubuntu if path.ends_with("check_network_status.txt") => {
                HttpResponse::text(200, "NetworkManager is online\n")
            }
            CaptivePortalType::Amazon if path.contains("wifistub") => HttpResponse::html(
                200,
                "<html><head><title>Kindle Wifi</title></head><body>81ce4465-7167-4dcb-835b-dcc9e44c112a</body></html>",
            ),
            CaptivePortalType::Nintendo => {
                HttpResponse::text(200, "ok").with_header("X-Organization", "Nintendo")
            }
            _ => HttpResponse::no_content(),
        }
    }
}

fn is_204_path(path: &str) -> bool {
    path.ends_with("/generate_204") || path.ends_with("/gen_204")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_hosts_classify() {
        assert_eq!(
            CaptivePortalType::detect("captive.apple.com", "/hotspot-detect.html"),
            Some(CaptivePortalType::Apple)
        );
        assert_eq!(
            CaptivePortalType::detect("connectivitycheck.gstatic.com", "/generate_204"),
            Some(CaptivePortalType::Android)
        );
        assert_eq!(
            CaptivePortalType::detect("www.msftconnecttest.com", "/connecttest.txt"),
            Some(CaptivePortalType::Windows)
        );
        assert_eq!(
            CaptivePortalType::detect("conntest.nintendowifi.net", "/"),
            Some(CaptivePortalType::Nintendo)
        );
    }

    #[test]
    fn google_web_host_is_not_a_probe() {
        assert_eq!(CaptivePortalType::detect("www.google.com", "/search"), None);
        assert_eq!(
            CaptivePortalType::detect("www.google.com", "/gen_204"),
            Some(CaptivePortalType::Chrome)
        );
    }

    #[test]
    fn path_heuristics_behind_unknown_hosts() {
        assert_eq!(
            CaptivePortalType::detect("192.168.50.1", "/ncsi.txt"),
            Some(CaptivePortalType::Windows)
        );
        assert_eq!(
            CaptivePortalType::detect("example.net", "/mobile/status.php/connectivity"),
            Some(CaptivePortalType::Generic)
        );
        assert_eq!(CaptivePortalType::detect("example.net", "/index.html"), None);
    }

    #[test]
    fn success_bodies_are_exact() {
        let ncsi = CaptivePortalType::Windows.success_response("/ncsi.txt");
        assert_eq!(ncsi.status, 200);
        assert_eq!(ncsi.body, b"Microsoft NCSI");

        let firefox = CaptivePortalType::Firefox.success_response("/success.txt");
        assert_eq!(firefox.body, b"success\n");

        let android = CaptivePortalType::Android.success_response("/generate_204");
        assert_eq!(android.status, 204);
        assert!(android.body.is_empty());

        let apple = CaptivePortalType::Apple.success_response("/hotspot-detect.html");
        assert!(apple.body_text().contains("<TITLE>Success</TITLE>"));

        let nintendo = CaptivePortalType::Nintendo.success_response("/");
        assert_eq!(nintendo.header("X-Organization"), Some("Nintendo"));
    }
}
