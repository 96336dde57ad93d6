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

//! Request-dispatch core for an L7 reverse proxy's FastCGI backend side:
//! a FastCGI multiplexer, a Fast Weighted Round-Robin load balancer, and a
//! priority queue with fairness dequeuing.
//!
//! See `SPEC_FULL.md` in the repository root for the full component
//! contracts. The three subsystems compose as: [`queue`] holds pending
//! requests until a server slot is free, [`lb::fwrr`] picks a server when
//! none was pre-assigned, and [`mux`] frames the chosen request onto a
//! [`transport::Transport`] as FastCGI records.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod htx;
pub mod http1;
pub mod lb;
pub mod mux;
pub mod queue;
pub mod record;
pub mod server;
pub mod transport;

pub use backend::{Backend, ServerClass};
pub use config::FcgiAppConfig;
pub use error::{DispatchError, DispatchResult};
pub use server::{Server, ServerId, ServerState};
