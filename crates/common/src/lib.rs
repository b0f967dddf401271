// huddle-common: wire protocol and domain types shared by relay and client

pub mod mention;
pub mod protocol;
pub mod types;
