//! Access policies for the zamek policy runtime.
//!
//! - **audit**: Logs every scan and decision, never decides
//! - **card_list**: Accepts cards listed in a local allow-list file

pub mod audit;
pub mod card_list;

pub use audit::LoggingPolicy;
pub use card_list::{CardList, CardListPolicy};
