pub mod kis_rest;
pub mod paper;

pub use kis_rest::KisClient;
pub use paper::{FillBehavior, PaperBroker, PaperOrder};
