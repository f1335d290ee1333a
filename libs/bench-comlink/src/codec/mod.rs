//! Frame codecs for the two instrument families

pub mod load_frame;
pub mod vdc_frame;
