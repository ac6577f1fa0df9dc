//! Suspend-mode calls.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::call_table::PendingCall;
use crate::error::{Error, Result};
use crate::protocol::{Args, MethodSpec};
use crate::session::Session;

/// A remote method taken from a session's root contract.
#[derive(Debug, Clone, Copy)]
pub struct RemoteMethod<'a> {
    session: &'a Session,
    spec: &'a MethodSpec,
}

impl<'a> RemoteMethod<'a> {
    /// Method name.
    #[must_use]
    pub fn name(&self) -> &'a str {
        &self.spec.name
    }

    /// Parameter names in declaration order.
    #[must_use]
    pub fn params(&self) -> &'a [String] {
        &self.spec.params
    }

    /// Issue the call.
    ///
    /// # Errors
    ///
    /// See [`Session::call`].
    pub fn call(&self, args: impl Into<Args>) -> Result<PendingCall> {
        self.session.call(&self.spec.name, args)
    }

    /// Call and decode the result into `T`.
    ///
    /// # Errors
    ///
    /// See [`Session::call_as`].
    pub async fn call_as<T: DeserializeOwned>(&self, args: impl Into<Args>) -> Result<T> {
        self.session.call_as(&self.spec.name, args).await
    }
}

impl Session {
    /// Look up a callable method in the root contract.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MethodNotFound`] without contacting the peer if the
    /// root does not declare the method.
    pub fn method(&self, name: &str) -> Result<RemoteMethod<'_>> {
        let spec = self.contract_method(name)?;
        Ok(RemoteMethod {
            session: self,
            spec,
        })
    }

    /// Call and wait for the result.
    ///
    /// # Errors
    ///
    /// Returns whatever the call failed with.
    pub async fn invoke(&self, method: &str, args: impl Into<Args>) -> Result<Value> {
        self.call(method, args)?.await
    }

    /// Call and decode the result into `T`.
    ///
    /// # Errors
    ///
    /// Returns whatever the call failed with, or a serialization error if the
    /// result does not decode into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: impl Into<Args>,
    ) -> Result<T> {
        let value = self.invoke(method, args).await?;
        serde_json::from_value(value).map_err(|e| {
            Error::Serialization(format!("result of {method}() did not decode: {e}"))
        })
    }

    /// Call with a deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no result arrived in time; the call is
    /// abandoned and a late reply is discarded.
    pub async fn call_timeout(
        &self,
        method: &str,
        args: impl Into<Args>,
        timeout: Duration,
    ) -> Result<Value> {
        self.call(method, args)?.timeout(timeout).await
    }
}
