//! Opens the dashboard in the desktop's default browser once the server is
//! listening. Failures are logged and otherwise ignored.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::process::Command;

/// URL a local browser should use to reach a server bound to `bound`.
/// Wildcard binds are reached through loopback.
pub fn dashboard_url(bound: SocketAddr) -> String {
    let host = match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}/", SocketAddr::new(host, bound.port()))
}

#[cfg(target_os = "macos")]
fn opener(url: &str) -> Command {
    let mut command = Command::new("open");
    command.arg(url);
    command
}

#[cfg(target_os = "windows")]
fn opener(url: &str) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", "", url]);
    command
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn opener(url: &str) -> Command {
    let mut command = Command::new("xdg-open");
    command.arg(url);
    command
}

/// Launch the platform opener for `url` in the background.
pub fn open(url: &str) {
    let mut command = opener(url);
    match command.spawn() {
        Ok(mut child) => {
            let url = url.to_string();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => log::info!("Opened {} in browser", url),
                    Ok(status) => log::warn!("Browser opener exited with {}", status),
                    Err(e) => log::warn!("Browser opener failed: {}", e),
                }
            });
        }
        Err(e) => log::warn!("Could not open a browser for {}: {}", url, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dashboard_url() {
        assert_eq!(
            dashboard_url("127.0.0.1:8000".parse().unwrap()),
            "http://127.0.0.1:8000/"
        );
        assert_eq!(
            dashboard_url("0.0.0.0:8080".parse().unwrap()),
            "http://127.0.0.1:8080/"
        );
        assert_eq!(dashboard_url("[::]:9000".parse().unwrap()), "http://[::1]:9000/");
        assert_eq!(
            dashboard_url("192.168.1.5:8000".parse().unwrap()),
            "http://192.168.1.5:8000/"
        );
    }

    #[test]
    fn test_opener_receives_url() {
        let command = opener("http://127.0.0.1:8000/");
        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args.last().copied(), Some(std::ffi::OsStr::new("http://127.0.0.1:8000/")));
    }
}
