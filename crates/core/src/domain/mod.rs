pub mod call;
pub mod lead;
pub mod qualification;
pub mod transcript;
