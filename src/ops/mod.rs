pub mod onnx;
pub mod patchmatch;
