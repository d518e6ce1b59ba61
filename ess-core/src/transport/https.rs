//! HTTPS client with mutual TLS for uploading measurement records and board
//! photos to the central database, grounded on `reqwest`'s identity/client
//! cert support.

use std::path::Path;

use ess_model::error::EssError;
use rand::Rng;
use reqwest::{Certificate, Client, Identity};
use serde::Serialize;
use serde_json::Value;

fn io_err(context: &str, err: impl std::fmt::Display) -> EssError {
    EssError::Transient {
        transport: "https".to_string(),
        message: format!("{context}: {err}"),
    }
}

/// Wraps a `reqwest::Client` configured with a client identity and trusted
/// root, so every request on this client presents the same certificate.
pub struct HttpsMtlsClient {
    client: Client,
    base_url: String,
}

impl HttpsMtlsClient {
    pub fn new(base_url: impl Into<String>, identity_pem: &[u8], ca_pem: &[u8]) -> Result<Self, EssError> {
        let identity = Identity::from_pem(identity_pem).map_err(|e| io_err("parsing client identity", e))?;
        let ca = Certificate::from_pem(ca_pem).map_err(|e| io_err("parsing CA certificate", e))?;
        let client = Client::builder()
            .identity(identity)
            .add_root_certificate(ca)
            .use_rustls_tls()
            .build()
            .map_err(|e| io_err("building https client", e))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, EssError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| io_err("GET request failed", e))?;
        if !resp.status().is_success() {
            return Err(EssError::Protocol {
                transport: "https".to_string(),
                code: resp.status().as_u16() as u8,
                message: format!("unexpected status from {path}"),
            });
        }
        resp.json().await.map_err(|e| io_err("parsing JSON response", e))
    }

    pub async fn post_json<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<Value, EssError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| io_err("POST request failed", e))?;
        if !resp.status().is_success() {
            return Err(EssError::Protocol {
                transport: "https".to_string(),
                code: resp.status().as_u16() as u8,
                message: format!("unexpected status from {path}"),
            });
        }
        resp.json().await.map_err(|e| io_err("parsing JSON response", e))
    }

    /// Uploads `fields` plus each file in `files` (field name -> path) as a
    /// single multipart form. The boundary is randomly generated and
    /// re-rolled if it happens to appear as a byte sequence inside any
    /// attached file, since a colliding boundary would corrupt the frame.
    pub async fn post_multipart(
        &self,
        path: &str,
        fields: &[(&str, &str)],
        files: &[(&str, &Path)],
    ) -> Result<Value, EssError> {
        let boundary = pick_non_colliding_boundary(files)?;

        let mut form = reqwest::multipart::Form::new()
            .percent_encode_noop()
            .boundary(boundary);
        for (key, value) in fields {
            form = form.text(key.to_string(), value.to_string());
        }
        for (field, file_path) in files {
            let bytes = std::fs::read(file_path).map_err(|e| io_err("reading attachment", e))?;
            let file_name = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("attachment")
                .to_string();
            let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
            form = form.part(field.to_string(), part);
        }

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .multipart(form)
            .send()
            .await
            .map_err(|e| io_err("multipart POST failed", e))?;
        if !resp.status().is_success() {
            return Err(EssError::Protocol {
                transport: "https".to_string(),
                code: resp.status().as_u16() as u8,
                message: format!("unexpected status from {path}"),
            });
        }
        resp.json().await.map_err(|e| io_err("parsing JSON response", e))
    }
}

/// Scans each attached file for `boundary` as a byte substring using a
/// memory-mapped read, re-rolling on collision. Collisions are vanishingly
/// rare but a corrupted multipart frame is worse than a few extra attempts.
fn pick_non_colliding_boundary(files: &[(&str, &Path)]) -> Result<String, EssError> {
    for _ in 0..8 {
        let candidate = random_boundary();
        let mut collides = false;
        for (_, file_path) in files {
            let file = std::fs::File::open(file_path).map_err(|e| io_err("opening attachment for scan", e))?;
            if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                continue;
            }
            let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| io_err("mmapping attachment", e))?;
            if contains_subslice(&mmap, candidate.as_bytes()) {
                collides = true;
                break;
            }
        }
        if !collides {
            return Ok(candidate);
        }
    }
    Err(EssError::Invariant(
        "could not find a non-colliding multipart boundary after 8 attempts".to_string(),
    ))
}

fn random_boundary() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let tail: String = (0..24)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("ess-boundary-{tail}")
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_contains_expected_prefix() {
        let b = random_boundary();
        assert!(b.starts_with("ess-boundary-"));
        assert_eq!(b.len(), "ess-boundary-".len() + 24);
    }

    #[test]
    fn subslice_detection_is_correct() {
        assert!(contains_subslice(b"hello world", b"lo wo"));
        assert!(!contains_subslice(b"hello world", b"xyz"));
        assert!(!contains_subslice(b"short", b"this is longer"));
    }
}
