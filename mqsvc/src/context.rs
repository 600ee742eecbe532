//! Scoped access to the message currently being handled.
//!
//! Handlers receive their [`MessageContext`] as a parameter. This module is
//! only for code that sits behind an API which cannot take one (the
//! [`RemoteInvoker`](crate::invoker::RemoteInvoker) reads it to propagate the
//! correlation id). The previous context is restored when the scoped future
//! completes, errors, or is dropped.

use crate::message::MessageContext;
use std::future::Future;

tokio::task_local! {
    static CURRENT: MessageContext;
}

/// Run `fut` with `ctx` as the current context.
pub async fn scope<F>(ctx: MessageContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// The innermost context entered with [`scope`] on this task, if any.
pub fn current() -> Option<MessageContext> {
    CURRENT.try_with(Clone::clone).ok()
}
