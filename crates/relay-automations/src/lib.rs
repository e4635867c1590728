mod automation;
mod dispatcher;
mod handler;
mod registry;
mod result;

pub mod accounting;
pub mod cash_flow;
pub mod credit;
pub mod crm;
pub mod dedup;
pub mod digest;
pub mod documents;
pub mod hr;
pub mod month_end;
pub mod project;
pub mod purchase;
pub mod recon;
pub mod report;
pub mod sales;
pub mod supply_chain;

pub use automation::Automation;
pub use dispatcher::{Dispatcher, DispatchOutcome, Disposition, GatingDefaults};
pub use handler::{handler, EventCtx, Handler, HandlerTable};
pub use registry::{AutomationRegistry, RegisteredAutomation};
pub use result::AutomationResult;

#[cfg(test)]
pub(crate) mod testing;
