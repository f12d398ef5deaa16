mod esrgan;
mod ncnn;
mod resize;

pub use esrgan::EsrganBackend;
pub use ncnn::NcnnBackend;
pub use resize::ResizeBackend;
