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

//! The FastCGI multiplexer: connection/stream state machine, demux/mux
//! algorithms, and outgoing parameter construction (spec §4.4).

pub mod demux;
pub mod muxer;
pub mod params_builder;
pub mod stream;

pub use muxer::{ConnFlags, ConnState, Connection, MAX_MUX_BUFFERS, MAX_STREAM_ID};
pub use stream::{Stream, StreamFlags, StreamState};
