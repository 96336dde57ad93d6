// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Translates a structured outgoing message into FastCGI `PARAMS`
//! (spec §4.4 steps 2-4: header-to-param translation, default params in
//! fixed order, and SCRIPT_NAME/PATH_INFO derivation).

use http::Method;

use crate::config::FcgiAppConfig;
use crate::htx::HtxBlock;

/// Accumulated request-line state needed to fill in default params, built
/// while walking the outgoing message's blocks.
#[derive(Debug, Default, Clone)]
pub struct RequestLine {
    /// `REQUEST_METHOD`.
    pub method: String,
    /// Raw request target as given on the start line (path[?query]).
    pub uri: String,
    /// `SERVER_PROTOCOL`, e.g. `HTTP/1.1`.
    pub server_protocol: String,
    /// True if the method is `HEAD` (parser flag per spec 4.4 start-line step).
    pub is_head: bool,
}

/// Builds the ordered list of FastCGI parameters for one request, following
/// spec §4.4 steps 2 ("header" + "start-line" translation), 3 (mandatory
/// defaults in fixed order) and 4 (SCRIPT_NAME/PATH_INFO derivation).
///
/// `remote_addr`/`remote_port`/`server_port`/`is_tls` stand in for the
/// connection-level facts the real proxy's session object would supply
/// (out of scope per spec §1, threaded in here as plain arguments).
#[allow(clippy::too_many_arguments)]
pub fn build_params(
    config: &FcgiAppConfig, headers: &[HtxBlock], request_line: &RequestLine, remote_addr: &str, remote_port: u16,
    server_port: u16, is_tls: bool,
) -> Result<Vec<(String, String)>, crate::error::DispatchError> {
    let mut params = Vec::new();
    let mut content_length: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut server_name: Option<String> = None;
    let mut te: Option<String> = None;
    let mut overridden: std::collections::HashSet<String> = std::collections::HashSet::new();

    for block in headers {
        let HtxBlock::Header { name, value } = block else { continue };
        if let Some(tag) = name.strip_prefix(":fcgi-") {
            let key = tag.to_ascii_uppercase();
            overridden.insert(key.clone());
            params.push((key, value.clone()));
            continue;
        }
        if let Some(header_name) = &config.server_id_header {
            if name.eq_ignore_ascii_case(header_name) {
                continue; // re-emitted at end-of-headers
            }
        }
        match name.as_str() {
            "content-length" => content_length = Some(value.clone()),
            "content-type" => content_type = Some(value.clone()),
            "host" => server_name = Some(value.clone()),
            "te" => {
                if value.split(',').any(|v| v.trim().eq_ignore_ascii_case("trailers")) {
                    te = Some("trailers".to_string());
                }
            }
            other => {
                let key = format!("HTTP_{}", other.to_ascii_uppercase().replace('-', "_"));
                params.push((key, value.clone()));
            }
        }
    }
    if let Some(te) = te {
        params.push(("HTTP_TE".to_string(), te));
    }

    let (path, query) = match request_line.uri.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (request_line.uri.clone(), None),
    };
    let (script_name, path_info) = derive_script_name_and_path_info(config, &path)?;

    let document_root = config.docroot.clone();
    let script_filename = format!("{document_root}{script_name}");
    let path_translated = path_info.as_ref().map(|pi| format!("{document_root}{pi}"));

    // A `:fcgi-<tag>` header overrides the corresponding default param
    // (spec §4.4 step 2/3): only emit a default if no override claimed its name.
    let mut push_default = |params: &mut Vec<(String, String)>, key: &str, value: String| {
        if !overridden.contains(key) {
            params.push((key.to_string(), value));
        }
    };

    push_default(&mut params, "GATEWAY_INTERFACE", "CGI/1.1".to_string());
    push_default(&mut params, "DOCUMENT_ROOT", document_root);
    push_default(&mut params, "SCRIPT_NAME", script_name);
    if let Some(pi) = &path_info {
        push_default(&mut params, "PATH_INFO", pi.clone());
    }
    push_default(&mut params, "REQUEST_URI", request_line.uri.clone());
    push_default(&mut params, "REQUEST_METHOD", request_line.method.clone());
    push_default(&mut params, "QUERY_STRING", query.unwrap_or_default());
    push_default(&mut params, "SERVER_NAME", server_name.unwrap_or_default());
    push_default(&mut params, "SERVER_PORT", server_port.to_string());
    push_default(&mut params, "SERVER_PROTOCOL", request_line.server_protocol.clone());
    push_default(&mut params, "REMOTE_ADDR", remote_addr.to_string());
    push_default(&mut params, "REMOTE_PORT", remote_port.to_string());
    push_default(&mut params, "SCRIPT_FILENAME", script_filename);
    if let Some(pt) = path_translated {
        push_default(&mut params, "PATH_TRANSLATED", pt);
    }
    push_default(&mut params, "CONTENT_LENGTH", content_length.unwrap_or_else(|| "0".to_string()));
    if let Some(ct) = content_type {
        push_default(&mut params, "CONTENT_TYPE", ct);
    }
    push_default(&mut params, "SERVER_SOFTWARE", config.server_software.clone());
    if is_tls {
        push_default(&mut params, "HTTPS", "on".to_string());
    }

    Ok(params)
}

/// Derives `SCRIPT_NAME`/`PATH_INFO` from the URL-decoded path (spec §4.4
/// step 4). Rejects a NUL or LF in the decoded path.
fn derive_script_name_and_path_info(
    config: &FcgiAppConfig, path: &str,
) -> Result<(String, Option<String>), crate::error::DispatchError> {
    let decoded = percent_decode(path);
    if decoded.bytes().any(|b| b == 0 || b == b'\n') {
        return Err(crate::error::DispatchError::PathInfoRejected {
            reason: "decoded path contains NUL or LF",
        });
    }

    let (mut script_name, path_info) = if let Some(re) = &config.path_info_regex {
        match re.captures(&decoded) {
            Some(caps) => {
                let script = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(|| decoded.clone());
                let info = caps.get(2).map(|m| m.as_str().to_string());
                (script, info)
            }
            None => (decoded.clone(), None),
        }
    } else {
        (decoded.clone(), None)
    };

    if script_name.ends_with('/') {
        if let Some(index) = &config.index_file {
            script_name.push_str(index);
        }
    }

    Ok((script_name, path_info))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extracts the accumulated [`RequestLine`] from a start-line block.
pub fn request_line_from_start_line(method: &Method, target: &str, version: http::Version) -> RequestLine {
    RequestLine {
        method: method.to_string(),
        uri: target.to_string(),
        server_protocol: match version {
            http::Version::HTTP_10 => "HTTP/1.0".to_string(),
            _ => "HTTP/1.1".to_string(),
        },
        is_head: method == Method::HEAD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_params_for_simple_get() {
        let config = FcgiAppConfig::minimal("/var/www");
        let headers = vec![HtxBlock::Header { name: "host".to_string(), value: "h".to_string() }];
        let request_line = request_line_from_start_line(&Method::GET, "/a", http::Version::HTTP_11);
        let params = build_params(&config, &headers, &request_line, "127.0.0.1", 4242, 80, false).unwrap();
        let get = |k: &str| params.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());
        assert_eq!(get("REQUEST_METHOD").as_deref(), Some("GET"));
        assert_eq!(get("REQUEST_URI").as_deref(), Some("/a"));
        assert_eq!(get("SCRIPT_NAME").as_deref(), Some("/a"));
        assert_eq!(get("SERVER_PROTOCOL").as_deref(), Some("HTTP/1.1"));
        assert_eq!(get("HTTP_HOST").as_deref(), Some("h"));
        assert_eq!(get("CONTENT_LENGTH").as_deref(), Some("0"));
    }

    #[test]
    fn rejects_nul_byte_in_decoded_path() {
        let config = FcgiAppConfig::minimal("/var/www");
        let request_line = request_line_from_start_line(&Method::GET, "/a%00b", http::Version::HTTP_11);
        let err = build_params(&config, &[], &request_line, "127.0.0.1", 1, 80, false).unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::PathInfoRejected { .. }));
    }

    #[test]
    fn path_info_regex_splits_script_name_and_path_info() {
        let mut config = FcgiAppConfig::minimal("/var/www");
        config.path_info_regex = Some(regex::Regex::new(r"^(/[^/]+\.php)(/.*)?$").unwrap());
        let request_line = request_line_from_start_line(&Method::GET, "/index.php/extra", http::Version::HTTP_11);
        let params = build_params(&config, &[], &request_line, "127.0.0.1", 1, 80, false).unwrap();
        let get = |k: &str| params.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());
        assert_eq!(get("SCRIPT_NAME").as_deref(), Some("/index.php"));
        assert_eq!(get("PATH_INFO").as_deref(), Some("/extra"));
        assert_eq!(get("PATH_TRANSLATED").as_deref(), Some("/var/www/extra"));
    }
}
