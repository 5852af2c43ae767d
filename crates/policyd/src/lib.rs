//! Policy daemon driver.
//!
//! Loads a [`Scenario`] and runs it through the policy engine, the DNS
//! rule compiler and the endpoint slice allocator, producing a [`Report`]
//! with every endpoint's map state.

mod driver;
mod error;
mod report;
mod scenario;

pub use driver::{run, DriverConfig};
pub use error::{PolicydError, Result};
pub use report::{DnsError, DnsQueryReport, EndpointReport, MapEntry, RejectedRule, Report};
pub use scenario::{
    selector, DnsQuerySpec, EndpointSpec, RedirectSpec, RuleSpec, Scenario, SecretSpec, SelectionSpec,
    WILDCARD_SELECTOR,
};
