pub mod support;

mod recommendations;
