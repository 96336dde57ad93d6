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

//! Per-backend FastCGI application configuration.
//!
//! The spec treats configuration parsing as an out-of-scope collaborator
//! (§1, §6 "Configuration"); this only defines the concrete struct its
//! interface implies, built programmatically the way the teacher crate's
//! `Params` is built by callers rather than parsed from a file.

use regex::Regex;

/// Static, per-backend FastCGI application parameters.
#[derive(Debug, Clone)]
pub struct FcgiAppConfig {
    /// `DOCUMENT_ROOT` sent with every request.
    pub docroot: String,
    /// Filename appended to `SCRIPT_NAME` when it ends in `/`.
    pub index_file: Option<String>,
    /// Matched against the URL-decoded path to split `SCRIPT_NAME` from
    /// `PATH_INFO`; capture group 1 is `SCRIPT_NAME`, group 2 (if present)
    /// is `PATH_INFO`.
    pub path_info_regex: Option<Regex>,
    /// Value for `SERVER_SOFTWARE` when the response doesn't supply one.
    pub server_software: String,
    /// Whether `BEGIN_REQUEST`'s `KEEP_CONN` flag should be set.
    pub keep_conn: bool,
    /// Whether to probe the application with `GET_VALUES` on connect.
    pub get_values_supported: bool,
    /// Whether this application is assumed to support multiplexing absent
    /// a `GET_VALUES_RESULT` telling us otherwise.
    pub mpxs_supported: bool,
    /// Cap applied to the connection's advertised/assumed `streams_limit`.
    pub max_requests: u16,
    /// Header name re-emitted at end-of-headers carrying the server id,
    /// e.g. `:fcgi-server-id`. `None` disables the feature.
    pub server_id_header: Option<String>,
}

impl FcgiAppConfig {
    /// A minimal configuration suitable for tests: no path-info regex, no
    /// server-id header, multiplexing and GET_VALUES both assumed off.
    pub fn minimal(docroot: impl Into<String>) -> Self {
        Self {
            docroot: docroot.into(),
            index_file: None,
            path_info_regex: None,
            server_software: concat!("fcgi-dispatch/", env!("CARGO_PKG_VERSION")).to_string(),
            keep_conn: true,
            get_values_supported: false,
            mpxs_supported: false,
            max_requests: 1,
            server_id_header: None,
        }
    }
}
