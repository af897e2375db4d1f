//! Scenario tests running several pipeline stages together.
mod end_to_end;
mod multidex;
