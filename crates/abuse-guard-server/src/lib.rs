//! # abuse-guard-server
//!
//! HTTP request pipeline hosting the [`abuse_guard`] detector.
//!
//! Configuration comes from command-line flags or the matching environment
//! variables (see [`cli::Args`]). When `REDIS_URL` is set, counters are shared
//! through Redis; otherwise, or when Redis cannot be reached, each process
//! tracks clients on its own.
//!
//! ## API Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Liveness probe |
//! | `/api/ping` | GET | Trivial guarded endpoint |
//! | `/api/guard/stats` | GET | Detector activity counters |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod error;
pub mod routes;
pub mod server;

pub use cli::Args;
pub use error::{ServerError, ServerResult};
pub use routes::create_router;
pub use server::{GuardServer, build_detector};
