pub mod api;
pub mod buttons;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod display;
pub mod presentation;
pub mod probes;
pub mod process_runner;
pub mod system_control;
