use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

/// Why a subscription URL was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedUrlError {
    #[error("Invalid URL: {0}")]
    Malformed(#[from] url::ParseError),
    #[error("Unsupported scheme '{0}' (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("Local or private address not allowed: {0}")]
    LocalAddress(String),
}

/// Validate a feed address coming from an imported document.
///
/// Only `http`/`https` URLs with a public host are accepted; loopback,
/// private, link-local and unspecified addresses are refused so a crafted
/// subscription list cannot point later refreshes at the local network.
pub fn validate_feed_url(input: &str) -> Result<Url, FeedUrlError> {
    let url = Url::parse(input.trim())?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(FeedUrlError::UnsupportedScheme(url.scheme().to_owned()));
    }

    let local = match url.host() {
        None => return Err(FeedUrlError::MissingHost),
        Some(Host::Domain(domain)) => {
            domain.eq_ignore_ascii_case("localhost") || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_local(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_local(IpAddr::V6(ip)),
    };
    if local {
        return Err(FeedUrlError::LocalAddress(
            url.host_str().unwrap_or_default().to_owned(),
        ));
    }

    Ok(url)
}

fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
    }
}
