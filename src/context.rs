use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    time::Instant,
};

/// Outcome of the admission check, recorded for the response hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub key: String,
    pub allowed: bool,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    /// `None` when no limiter ran for this request.
    pub admission: Option<Admission>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            client_ip,
            started_at: Instant::now(),
            admission: None,
        }
    }

    pub fn record_admission(&mut self, key: String, allowed: bool) {
        self.admission = Some(Admission { key, allowed });
    }
}
