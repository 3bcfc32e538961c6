//! Built-in HTML for the portal flow.

use hotgate_net::MacAddr;

use crate::session::Session;

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title}</title>\
         <style>body{{font-family:sans-serif;max-width:26rem;margin:2rem auto;padding:0 1rem}}\
         input{{display:block;width:100%;margin:.4rem 0;padding:.5rem}}\
         .err{{color:#b00}}</style></head><body><h1>{title}</h1>{body}</body></html>",
        title = escape(title),
    )
}

fn credentials_form(action: &str, button: &str) -> String {
    format!(
        "<form method=\"post\" action=\"{action}\">\
         <input name=\"username\" placeholder=\"Username\" autocomplete=\"username\" required>\
         <input name=\"password\" type=\"password\" placeholder=\"Password\" required>\
         <input type=\"submit\" value=\"{button}\"></form>"
    )
}

fn error_line(error: Option<&str>) -> String {
    error
        .map(|e| format!("<p class=\"err\">{}</p>", escape(e)))
        .unwrap_or_default()
}

pub fn login(ssid: &str, error: Option<&str>) -> String {
    layout(
        &format!("Welcome to {ssid}"),
        &format!(
            "{}{}<p><a href=\"/portal/register\">Create an account</a></p>",
            error_line(error),
            credentials_form("/portal/login", "Log in")
        ),
    )
}

pub fn register(error: Option<&str>) -> String {
    layout(
        "Create an account",
        &format!(
            "{}{}<p><a href=\"/portal/login\">Back to login</a></p>",
            error_line(error),
            credentials_form("/portal/register", "Register")
        ),
    )
}

pub fn status(session: &Session) -> String {
    layout(
        "You are online",
        &format!(
            "<p>Signed in as <b>{}</b> since {}.</p><p>Device {}</p>\
             <form method=\"post\" action=\"/portal/logout\"><input type=\"submit\" value=\"Log out\"></form>",
            escape(&session.username),
            session.created_at.format("%Y-%m-%d %H:%M UTC"),
            session.device_mac,
        ),
    )
}

pub fn message(title: &str, text: &str) -> String {
    layout(title, &format!("<p>{}</p>", escape(text)))
}

pub fn unidentified(ip: &str) -> String {
    message(
        "Device not recognised",
        &format!("No hardware address is known for {ip}. Reconnect to the network and try again."),
    )
}

pub fn logged_out(mac: MacAddr) -> String {
    message("Logged out", &format!("Internet access for {mac} has ended."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<a href='x'>&</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn login_page_escapes_ssid_and_error() {
        let page = login("<cafe>", Some("bad \"creds\""));
        assert!(page.contains("Welcome to &lt;cafe&gt;"));
        assert!(page.contains("bad &quot;creds&quot;"));
        assert!(page.contains("action=\"/portal/login\""));
    }
}
