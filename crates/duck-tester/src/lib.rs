//! The duck test, served as an RPC root type.
//!
//! Each session gets its own [`DuckTester`], which counts how many
//! descriptions it has inspected and emits a `duck_found` event whenever a
//! description passes.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use proven_session_rpc::{
    BlockingSession, RemoteError, Result, RootRegistry, RootType, Session, SessionContext, Value,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Name the root type is registered under.
pub const ROOT_TYPE: &str = "DuckTester";

/// The only answer that passes the test.
pub const LIKE_A_DUCK: &str = "like a duck";

/// What an object looks, swims and quacks like.
///
/// All three fields are required; a description missing one is rejected
/// before it reaches the test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuckDescription {
    /// How it looks.
    pub looks: String,
    /// How it swims.
    pub swims: String,
    /// How it quacks.
    pub quacks: String,
}

impl DuckDescription {
    /// A description that passes.
    #[must_use]
    pub fn like_a_duck() -> Self {
        Self {
            looks: LIKE_A_DUCK.to_string(),
            swims: LIKE_A_DUCK.to_string(),
            quacks: LIKE_A_DUCK.to_string(),
        }
    }

    /// Whether this describes a duck.
    #[must_use]
    pub fn is_a_duck(&self) -> bool {
        [&self.looks, &self.swims, &self.quacks]
            .iter()
            .all(|answer| answer.as_str() == LIKE_A_DUCK)
    }
}

/// Per-session root object.
pub struct DuckTester {
    ctx: SessionContext,
    inspected: u64,
}

impl DuckTester {
    fn inspect(&mut self, obj: &DuckDescription) -> Result<bool> {
        self.inspected += 1;
        let verdict = obj.is_a_duck();
        debug!(
            "Session {} inspected {:?}: {}",
            self.ctx.session_id(),
            obj,
            verdict
        );

        if verdict {
            self.ctx
                .emit("duck_found", json!({ "inspected": self.inspected }))?;
        }

        Ok(verdict)
    }
}

/// The `DuckTester` root type.
///
/// Methods:
/// - `is_it_a_duck(obj)`: runs the test on a [`DuckDescription`]
/// - `inspected()`: number of descriptions this session has inspected
#[must_use]
pub fn duck_tester() -> RootType<DuckTester> {
    RootType::new(ROOT_TYPE, |ctx, _open_args: Value| {
        Ok(DuckTester { ctx, inspected: 0 })
    })
    .method(
        "is_it_a_duck",
        &["obj"],
        |root: &mut DuckTester, (obj,): (DuckDescription,)| {
            Ok::<_, RemoteError>(root.inspect(&obj)?)
        },
    )
    .method("inspected", &[], |root: &mut DuckTester, (): ()| {
        Ok::<_, RemoteError>(root.inspected)
    })
}

/// Registry serving [`DuckTester`] as the default root type.
#[must_use]
pub fn registry() -> RootRegistry {
    RootRegistry::new().register(duck_tester())
}

/// Ask the remote duck tester about `obj`.
///
/// # Errors
///
/// Returns any call failure, e.g. `InvalidArguments` if `obj` lacks one of
/// the required keys.
pub async fn ask(session: &Session, obj: &Value) -> Result<bool> {
    session.call_as("is_it_a_duck", vec![obj.clone()]).await
}

/// Blocking form of [`ask`].
///
/// # Errors
///
/// Returns any call failure.
pub fn ask_blocking(session: &BlockingSession, obj: &Value) -> Result<bool> {
    session.call_as("is_it_a_duck", vec![obj.clone()])
}
