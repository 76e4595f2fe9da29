pub mod image_processing;
pub mod tensor;

// Re-export commonly used items
pub use image_processing::{parse_size, parse_window, ResizeFilter, Rescale, Window};
pub use tensor::{ImageTensor, TensorError};
