use std::{fmt, net::IpAddr};

use predicates::{reflection, Predicate};
use reqwest::{Request, Url};

/// Attach a credential to every request
#[derive(Clone, Copy, Debug, Default)]
pub struct AllRequests;

impl Predicate<Request> for AllRequests {
    #[inline]
    fn eval(&self, _: &Request) -> bool {
        true
    }
}

impl reflection::PredicateReflection for AllRequests {}
impl fmt::Display for AllRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any request")
    }
}

/// Attach a credential only when it cannot be read off the wire
///
/// Matches `https` URLs, and plain `http` URLs whose host is `localhost` or a
/// loopback address.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecureTransport;

fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_or(false, |ip| ip.is_loopback()),
        None => false,
    }
}

impl Predicate<Request> for SecureTransport {
    fn eval(&self, req: &Request) -> bool {
        let url = req.url();
        match url.scheme() {
            "https" => true,
            "http" => is_loopback(url),
            _ => false,
        }
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result)
                .add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                ))
                .add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or_default().to_owned(),
                ))
        })
    }
}

impl reflection::PredicateReflection for SecureTransport {}
impl fmt::Display for SecureTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("https, or http to loopback")
    }
}

/// Attach a credential only to requests bound for one of the listed hosts
///
/// Hosts are compared case-insensitively and without regard to port.
#[derive(Clone, Debug)]
pub struct AllowedHosts {
    hosts: Vec<String>,
}

impl AllowedHosts {
    /// Constructs a predicate matching any of `hosts`
    pub fn new<I>(hosts: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Predicate<Request> for AllowedHosts {
    fn eval(&self, req: &Request) -> bool {
        req.url()
            .host_str()
            .map_or(false, |host| self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "host",
                req.url().host_str().unwrap_or("<no host>").to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for AllowedHosts {}
impl fmt::Display for AllowedHosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host in [{}]", self.hosts.join(", "))
    }
}
