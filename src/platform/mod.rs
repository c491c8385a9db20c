mod main_loop;
mod scene;

pub use main_loop::start;
