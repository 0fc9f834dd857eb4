// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Top-level routing: category → top handler. The connection layer has
//! already drained the raw components off the stream; each top handler
//! parses and validates its own, authenticates where required, then routes
//! on the subcategory bits.

use crate::{
    errors::{ProtocolError, ProtocolResult},
    proto::{
        codes::ResponseCode,
        flags::RequestCategory,
        header::RequestHeader,
        response::{ResponseBody, ResponseHeader},
    },
    server::{context::AppContext, handlers},
};

pub type HandlerOutput = (ResponseHeader, Option<ResponseBody>);

pub async fn dispatch_request(
    ctx: &AppContext,
    header: &RequestHeader,
    auth_bytes: Option<&[u8]>,
    body_bytes: Option<&[u8]>,
) -> ProtocolResult<HandlerOutput> {
    let category = header.category;
    if category == RequestCategory::HEARTBEAT {
        // No auth, no body; the cheapest round trip the protocol has.
        Ok((
            ctx.response_header(ResponseCode::Heartbeat, header.finish),
            None,
        ))
    } else if category == RequestCategory::AUTH {
        handlers::auth::handle(ctx, header, auth_bytes).await
    } else if category == RequestCategory::FILE_OP {
        handlers::file::handle(ctx, header, auth_bytes, body_bytes).await
    } else if category == RequestCategory::PERMISSION {
        handlers::permission::handle(ctx, header, auth_bytes, body_bytes).await
    } else if category == RequestCategory::INFO {
        handlers::info::handle(ctx, header, auth_bytes, body_bytes).await
    } else {
        Err(ProtocolError::UnsupportedOperation(format!(
            "unknown category bits {:#07b}",
            category.bits()
        )))
    }
}
