// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service layer: request/response RPC over TCP with discovery through the
//! registration layer.
//!
//! Servers expose named methods; clients resolve every server instance of a
//! service name and fan calls out across them.

mod client;
mod protocol;
mod server;

pub use client::{Client, InstanceState, ResponseCallback, ServiceResponse};
pub use protocol::{
    CallState, RequestFrame, ResponseFrame, PROTOCOL_V0, PROTOCOL_V1, RET_INTERNAL_ERROR,
    RET_METHOD_NOT_FOUND, RET_OK, SERVICE_MAGIC,
};
pub use server::{MethodHandler, Server};
