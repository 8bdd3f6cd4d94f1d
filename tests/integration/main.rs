//! Integration tests for the scheduler
//!
//! Whole runs are driven against stub collaborators under paused tokio time,
//! so cooldowns and pacing delays complete instantly. `http_tests` runs the
//! reqwest executor against a wiremock server and a SQLite progress file.

mod http_tests;
mod scheduler_tests;
mod support;
