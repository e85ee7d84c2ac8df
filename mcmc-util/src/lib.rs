pub mod ais;
pub mod ess;
pub mod traits;

pub use ais::{AisSampler, AisSchedule};
pub use ess::elliptical_slice_step;
pub use traits::EssParam;
