pub mod conns;
pub mod history;
pub mod run;
