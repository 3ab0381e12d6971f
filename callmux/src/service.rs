//! Request handler contract used by the multiplexer.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CallError;

/// Computes the reply for one inbound call.
///
/// Implementations hold process-local lookup state only; the multiplexer owns
/// the request for the duration of the call and never reuses it.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Inbound request payload.
    type Request: Send + Sync + 'static;

    /// Reply payload.
    type Response: Send + 'static;

    /// Compute the reply for `request`.
    async fn call(&self, request: &Self::Request) -> Result<Self::Response, CallError>;
}

#[async_trait]
impl<S: Service> Service for Arc<S> {
    type Request = S::Request;
    type Response = S::Response;

    async fn call(&self, request: &Self::Request) -> Result<Self::Response, CallError> {
        (**self).call(request).await
    }
}

/// Adapts a synchronous closure into a [`Service`].
pub struct ServiceFn<F, Req, Resp> {
    f: F,
    _marker: std::marker::PhantomData<fn(&Req) -> Resp>,
}

/// Build a [`Service`] from a synchronous function.
pub fn service_fn<F, Req, Resp>(f: F) -> ServiceFn<F, Req, Resp>
where
    F: Fn(&Req) -> Result<Resp, CallError> + Send + Sync + 'static,
{
    ServiceFn {
        f,
        _marker: std::marker::PhantomData,
    }
}

#[async_trait]
impl<F, Req, Resp> Service for ServiceFn<F, Req, Resp>
where
    F: Fn(&Req) -> Result<Resp, CallError> + Send + Sync + 'static,
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    async fn call(&self, request: &Req) -> Result<Resp, CallError> {
        (self.f)(request)
    }
}
