// ============================================================================
// ONNX erase engine — image+mask inpainting model via ONNX Runtime
// ============================================================================
//
// Uses `libloading` to open onnxruntime.dll / libonnxruntime.so at runtime
// so the binary has NO compile-time dependency on ONNX Runtime. The user
// points EraseFE at the runtime library and a LaMa-style inpainting model
// (two inputs: image [1,3,H,W] in [0,1] and mask [1,1,H,W] in {0,1}; one
// output: the inpainted image [1,3,H,W]).
//
// Unlike per-call loading, the runtime, environment, and model session are
// acquired once in `OnnxEraseSession::new` — the multi-second cost the
// shared `SessionContext` exists to amortize — and every `erase()` call
// reuses them. Per-call tensors are wrapped in release guards so they are
// freed on every exit path.

#![allow(unsafe_op_in_unsafe_fn)]

use std::path::Path;

use image::{GrayImage, RgbaImage};

use crate::session::{InferenceSession, SessionError};

/// Errors that can occur while loading or running the ONNX Runtime.
#[derive(Debug)]
pub enum OnnxError {
    RuntimeNotFound(String),
    RuntimeLoadFailed(String),
    ModelNotFound(String),
    ModelLoadFailed(String),
    ApiInitFailed(String),
    InferenceFailed(String),
    InvalidOutput(String),
}

impl std::fmt::Display for OnnxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnnxError::RuntimeNotFound(p) => write!(f, "ONNX Runtime library not found: {}", p),
            OnnxError::RuntimeLoadFailed(e) => write!(f, "Failed to load ONNX Runtime: {}", e),
            OnnxError::ModelNotFound(p) => write!(f, "ONNX model file not found: {}", p),
            OnnxError::ModelLoadFailed(e) => write!(f, "Failed to load ONNX model: {}", e),
            OnnxError::ApiInitFailed(e) => write!(f, "ONNX Runtime API init failed: {}", e),
            OnnxError::InferenceFailed(e) => write!(f, "ONNX inference failed: {}", e),
            OnnxError::InvalidOutput(e) => write!(f, "Invalid ONNX output: {}", e),
        }
    }
}

impl std::error::Error for OnnxError {}

impl From<OnnxError> for SessionError {
    fn from(e: OnnxError) -> Self {
        match e {
            OnnxError::InferenceFailed(_) | OnnxError::InvalidOutput(_) => {
                SessionError::InferenceFailed(e.to_string())
            }
            other => SessionError::ConstructionFailed(other.to_string()),
        }
    }
}

// --- ONNX Runtime C API types --------------------------------------
// Opaque handles (never dereferenced in Rust — used as `*mut` pointers only)

#[repr(C)]
struct OrtEnv {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSession {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSessionOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtValue {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtMemoryInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtStatus {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtRunOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtAllocator {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTensorTypeAndShapeInfo {
    _private: [u8; 0],
}

/// ORT API version we target (compatible with ONNX Runtime 1.16+)
const ORT_API_VERSION: u32 = 18;

#[allow(dead_code)]
#[repr(u32)]
enum OrtLoggingLevel {
    Verbose = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

#[allow(dead_code)]
#[repr(u32)]
enum ONNXTensorElementDataType {
    Undefined = 0,
    Float = 1,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtAllocatorType {
    Invalid = -1,
    DeviceAllocator = 0,
    ArenaAllocator = 1,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtMemType {
    CpuInput = -2,
    CpuOutput = -1,
    Default = 0,
}

// Function pointer type aliases (C calling convention)
type CreateEnvFn = unsafe extern "C" fn(
    log_level: OrtLoggingLevel,
    logid: *const std::ffi::c_char,
    out: *mut *mut OrtEnv,
) -> *mut OrtStatus;

type CreateSessionOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtSessionOptions) -> *mut OrtStatus;

type CreateSessionFn = unsafe extern "C" fn(
    env: *const OrtEnv,
    model_path: *const std::ffi::c_char, // UTF-8 path on non-Windows; UTF-16 handled below
    options: *const OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> *mut OrtStatus;

type CreateTensorWithDataAsOrtValueFn = unsafe extern "C" fn(
    info: *const OrtMemoryInfo,
    data: *mut std::ffi::c_void,
    data_len: usize,
    shape: *const i64,
    shape_len: usize,
    element_type: ONNXTensorElementDataType,
    out: *mut *mut OrtValue,
) -> *mut OrtStatus;

type CreateCpuMemoryInfoFn = unsafe extern "C" fn(
    alloc_type: OrtAllocatorType,
    mem_type: OrtMemType,
    out: *mut *mut OrtMemoryInfo,
) -> *mut OrtStatus;

type RunFn = unsafe extern "C" fn(
    session: *mut OrtSession,
    run_options: *const OrtRunOptions,
    input_names: *const *const std::ffi::c_char,
    inputs: *const *const OrtValue,
    input_count: usize,
    output_names: *const *const std::ffi::c_char,
    output_count: usize,
    outputs: *mut *mut OrtValue,
) -> *mut OrtStatus;

type GetTensorMutableDataFn =
    unsafe extern "C" fn(value: *mut OrtValue, out: *mut *mut std::ffi::c_void) -> *mut OrtStatus;

type GetTensorTypeAndShapeFn = unsafe extern "C" fn(
    value: *const OrtValue,
    out: *mut *mut OrtTensorTypeAndShapeInfo,
) -> *mut OrtStatus;

type GetDimensionsCountFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut usize) -> *mut OrtStatus;

type GetDimensionsFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    dim_values: *mut i64,
    dim_values_length: usize,
) -> *mut OrtStatus;

type ReleaseEnvFn = unsafe extern "C" fn(env: *mut OrtEnv);
type ReleaseSessionFn = unsafe extern "C" fn(session: *mut OrtSession);
type ReleaseSessionOptionsFn = unsafe extern "C" fn(options: *mut OrtSessionOptions);
type ReleaseValueFn = unsafe extern "C" fn(value: *mut OrtValue);
type ReleaseMemoryInfoFn = unsafe extern "C" fn(info: *mut OrtMemoryInfo);
type ReleaseTensorTypeAndShapeInfoFn = unsafe extern "C" fn(info: *mut OrtTensorTypeAndShapeInfo);
type ReleaseStatusFn = unsafe extern "C" fn(status: *mut OrtStatus);
type GetErrorMessageFn = unsafe extern "C" fn(status: *const OrtStatus) -> *const std::ffi::c_char;
type SetIntraOpNumThreadsFn = unsafe extern "C" fn(
    options: *mut OrtSessionOptions,
    intra_op_num_threads: i32,
) -> *mut OrtStatus;
type SetSessionGraphOptimizationLevelFn = unsafe extern "C" fn(
    options: *mut OrtSessionOptions,
    graph_optimization_level: u32,
) -> *mut OrtStatus;
type SessionGetInputCountFn =
    unsafe extern "C" fn(session: *const OrtSession, out: *mut usize) -> *mut OrtStatus;
type SessionGetInputNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut std::ffi::c_char,
) -> *mut OrtStatus;
type SessionGetOutputNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut std::ffi::c_char,
) -> *mut OrtStatus;
type GetAllocatorWithDefaultOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtAllocator) -> *mut OrtStatus;
type AllocatorFreeFn = unsafe extern "C" fn(
    allocator: *mut OrtAllocator,
    ptr: *mut std::ffi::c_void,
) -> *mut OrtStatus;

/// OrtApiBase — the entry point struct returned by OrtGetApiBase()
#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const std::ffi::c_void,
    get_version_string: unsafe extern "C" fn() -> *const std::ffi::c_char,
}

/// The subset of the OrtApi vtable we actually use. OrtApi is a struct of
/// ~200 function pointers; we index into it by field offset (each pointer is
/// one machine word). Indices are counted from onnxruntime_c_api.h.
#[derive(Debug)]
struct OrtApi {
    raw: *const std::ffi::c_void,
}

unsafe impl Send for OrtApi {}
unsafe impl Sync for OrtApi {}

impl OrtApi {
    unsafe fn get_fn<T>(&self, index: usize) -> T {
        let ptr = self.raw as *const *const std::ffi::c_void;
        let fn_ptr = *ptr.add(index);
        std::mem::transmute_copy(&fn_ptr)
    }

    // Vtable positions, per the official header:
    //  2: GetErrorMessage     3: CreateEnv            7: CreateSession
    //  9: Run                10: CreateSessionOptions
    // 23: SetSessionGraphOptimizationLevel
    // 24: SetIntraOpNumThreads
    // 30: SessionGetInputCount
    // 36: SessionGetInputName 37: SessionGetOutputName
    // 49: CreateTensorWithDataAsOrtValue
    // 51: GetTensorMutableData
    // 61: GetDimensionsCount  62: GetDimensions
    // 65: GetTensorTypeAndShape
    // 69: CreateCpuMemoryInfo
    // 76: AllocatorFree       78: GetAllocatorWithDefaultOptions
    // 92: ReleaseEnv          93: ReleaseStatus       94: ReleaseMemoryInfo
    // 95: ReleaseSession      96: ReleaseValue
    // 99: ReleaseTensorTypeAndShapeInfo
    // 100: ReleaseSessionOptions

    fn get_error_message(&self) -> GetErrorMessageFn {
        unsafe { self.get_fn(2) }
    }
    fn create_env(&self) -> CreateEnvFn {
        unsafe { self.get_fn(3) }
    }
    fn create_session(&self) -> CreateSessionFn {
        unsafe { self.get_fn(7) }
    }
    fn run(&self) -> RunFn {
        unsafe { self.get_fn(9) }
    }
    fn create_session_options(&self) -> CreateSessionOptionsFn {
        unsafe { self.get_fn(10) }
    }
    fn set_session_graph_optimization_level(&self) -> SetSessionGraphOptimizationLevelFn {
        unsafe { self.get_fn(23) }
    }
    fn set_intra_op_num_threads(&self) -> SetIntraOpNumThreadsFn {
        unsafe { self.get_fn(24) }
    }
    fn session_get_input_count(&self) -> SessionGetInputCountFn {
        unsafe { self.get_fn(30) }
    }
    fn session_get_input_name(&self) -> SessionGetInputNameFn {
        unsafe { self.get_fn(36) }
    }
    fn session_get_output_name(&self) -> SessionGetOutputNameFn {
        unsafe { self.get_fn(37) }
    }
    fn create_tensor_with_data(&self) -> CreateTensorWithDataAsOrtValueFn {
        unsafe { self.get_fn(49) }
    }
    fn get_tensor_mutable_data(&self) -> GetTensorMutableDataFn {
        unsafe { self.get_fn(51) }
    }
    fn get_dimensions_count(&self) -> GetDimensionsCountFn {
        unsafe { self.get_fn(61) }
    }
    fn get_dimensions(&self) -> GetDimensionsFn {
        unsafe { self.get_fn(62) }
    }
    fn get_tensor_type_and_shape(&self) -> GetTensorTypeAndShapeFn {
        unsafe { self.get_fn(65) }
    }
    fn create_cpu_memory_info(&self) -> CreateCpuMemoryInfoFn {
        unsafe { self.get_fn(69) }
    }
    fn allocator_free(&self) -> AllocatorFreeFn {
        unsafe { self.get_fn(76) }
    }
    fn get_allocator_with_default_options(&self) -> GetAllocatorWithDefaultOptionsFn {
        unsafe { self.get_fn(78) }
    }
    fn release_env(&self) -> ReleaseEnvFn {
        unsafe { self.get_fn(92) }
    }
    fn release_status(&self) -> ReleaseStatusFn {
        unsafe { self.get_fn(93) }
    }
    fn release_memory_info(&self) -> ReleaseMemoryInfoFn {
        unsafe { self.get_fn(94) }
    }
    fn release_session(&self) -> ReleaseSessionFn {
        unsafe { self.get_fn(95) }
    }
    fn release_value(&self) -> ReleaseValueFn {
        unsafe { self.get_fn(96) }
    }
    fn release_tensor_type_and_shape_info(&self) -> ReleaseTensorTypeAndShapeInfoFn {
        unsafe { self.get_fn(99) }
    }
    fn release_session_options(&self) -> ReleaseSessionOptionsFn {
        unsafe { self.get_fn(100) }
    }
}

/// Extract the error message from an OrtStatus. None status (null) = success.
unsafe fn status_to_result(api: &OrtApi, status: *mut OrtStatus) -> Result<(), String> {
    if status.is_null() {
        Ok(())
    } else {
        let msg_ptr = (api.get_error_message())(status);
        let msg = if msg_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            std::ffi::CStr::from_ptr(msg_ptr)
                .to_string_lossy()
                .into_owned()
        };
        (api.release_status())(status);
        Err(msg)
    }
}

/// Validate a runtime/model path before any native code touches it:
/// absolute, no `..` traversal, expected extension.
pub fn validate_library_path(path: &str, for_runtime: bool) -> Result<(), OnnxError> {
    use std::path::Component;
    let p = Path::new(path);

    if path.is_empty() {
        return Err(OnnxError::RuntimeNotFound("Path is empty".to_string()));
    }
    if !p.is_absolute() {
        return Err(OnnxError::RuntimeLoadFailed(
            "ONNX path must be an absolute path".to_string(),
        ));
    }
    for component in p.components() {
        if component == Component::ParentDir {
            return Err(OnnxError::RuntimeLoadFailed(
                "ONNX path must not contain '..' components".to_string(),
            ));
        }
    }

    let ext = p
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if for_runtime {
        if !["dll", "so", "dylib"].contains(&ext.as_str()) {
            return Err(OnnxError::RuntimeLoadFailed(format!(
                "Expected a .dll/.so/.dylib file, got '.{}'",
                ext
            )));
        }
    } else if ext != "onnx" {
        return Err(OnnxError::ModelLoadFailed(format!(
            "Expected a .onnx model file, got '.{}'",
            ext
        )));
    }

    Ok(())
}

/// Releases one OrtValue when dropped — per-call tensors are freed on every
/// exit path, success or error.
struct ValueGuard<'a> {
    api: &'a OrtApi,
    value: *mut OrtValue,
}

impl Drop for ValueGuard<'_> {
    fn drop(&mut self) {
        if !self.value.is_null() {
            unsafe { (self.api.release_value())(self.value) };
        }
    }
}

/// A live inpainting session: runtime library + environment + model, loaded
/// once and reused for every `erase()` call.
#[derive(Debug)]
pub struct OnnxEraseSession {
    // Field order matters: `api` points into `_lib`, handles are released in
    // `Drop` before the library unloads (fields drop in declaration order,
    // and Drop::drop runs first).
    api: OrtApi,
    env: *mut OrtEnv,
    session_options: *mut OrtSessionOptions,
    session: *mut OrtSession,
    memory_info: *mut OrtMemoryInfo,
    image_input: std::ffi::CString,
    mask_input: std::ffi::CString,
    output_name: std::ffi::CString,
    _lib: libloading::Library,
}

// The handles are only ever used through `&self` and ORT's Run is
// thread-safe on a single session.
unsafe impl Send for OnnxEraseSession {}
unsafe impl Sync for OnnxEraseSession {}

impl OnnxEraseSession {
    /// Load the runtime and model. This is the expensive, potentially
    /// multi-second construction the `SessionContext` amortizes.
    pub fn new(runtime_path: &str, model_path: &str) -> Result<Self, OnnxError> {
        validate_library_path(runtime_path, true)?;
        validate_library_path(model_path, false)?;

        if !Path::new(runtime_path).exists() {
            return Err(OnnxError::RuntimeNotFound(runtime_path.to_string()));
        }
        if !Path::new(model_path).exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_string()));
        }

        unsafe {
            eprintln!("[ONNX] Loading ONNX Runtime from {}", runtime_path);
            let lib = libloading::Library::new(runtime_path)
                .map_err(|e| OnnxError::RuntimeLoadFailed(format!("{}", e)))?;

            let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> =
                lib.get(b"OrtGetApiBase").map_err(|e| {
                    OnnxError::RuntimeLoadFailed(format!("Symbol OrtGetApiBase not found: {}", e))
                })?;

            let api_base = get_api_base();
            if api_base.is_null() {
                return Err(OnnxError::ApiInitFailed(
                    "OrtGetApiBase returned null".to_string(),
                ));
            }
            let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
            if api_ptr.is_null() {
                return Err(OnnxError::ApiInitFailed(format!(
                    "OrtGetApi({}) returned null — runtime too old",
                    ORT_API_VERSION
                )));
            }
            let api = OrtApi { raw: api_ptr };

            let mut env: *mut OrtEnv = std::ptr::null_mut();
            status_to_result(
                &api,
                (api.create_env())(OrtLoggingLevel::Warning, c"EraseFE".as_ptr(), &mut env),
            )
            .map_err(OnnxError::ApiInitFailed)?;

            let mut session_options: *mut OrtSessionOptions = std::ptr::null_mut();
            if let Err(e) =
                status_to_result(&api, (api.create_session_options())(&mut session_options))
            {
                (api.release_env())(env);
                return Err(OnnxError::ApiInitFailed(e));
            }
            let num_threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4) as i32;
            let _ = status_to_result(
                &api,
                (api.set_intra_op_num_threads())(session_options, num_threads),
            );
            // ORT_ENABLE_ALL = 99
            let _ = status_to_result(
                &api,
                (api.set_session_graph_optimization_level())(session_options, 99),
            );

            eprintln!("[ONNX] Loading model {} (this may take a moment)...", model_path);
            let mut session: *mut OrtSession = std::ptr::null_mut();
            let create_status = {
                #[cfg(target_os = "windows")]
                {
                    // On Windows CreateSession expects a UTF-16 path
                    let wide: Vec<u16> =
                        model_path.encode_utf16().chain(std::iter::once(0)).collect();
                    (api.create_session())(
                        env,
                        wide.as_ptr() as *const std::ffi::c_char,
                        session_options,
                        &mut session,
                    )
                }
                #[cfg(not(target_os = "windows"))]
                {
                    let cpath = std::ffi::CString::new(model_path)
                        .map_err(|e| OnnxError::ModelLoadFailed(e.to_string()))?;
                    (api.create_session())(env, cpath.as_ptr(), session_options, &mut session)
                }
            };
            if let Err(e) = status_to_result(&api, create_status) {
                (api.release_session_options())(session_options);
                (api.release_env())(env);
                return Err(OnnxError::ModelLoadFailed(e));
            }

            // The model must take (image, mask); read the real tensor names
            // so renamed exports still work.
            let release_all = |api: &OrtApi| {
                (api.release_session())(session);
                (api.release_session_options())(session_options);
                (api.release_env())(env);
            };

            let mut allocator: *mut OrtAllocator = std::ptr::null_mut();
            if let Err(e) =
                status_to_result(&api, (api.get_allocator_with_default_options())(&mut allocator))
            {
                release_all(&api);
                return Err(OnnxError::ApiInitFailed(e));
            }

            let mut input_count: usize = 0;
            if let Err(e) = status_to_result(
                &api,
                (api.session_get_input_count())(session as *const _, &mut input_count),
            ) {
                release_all(&api);
                return Err(OnnxError::ModelLoadFailed(e));
            }
            if input_count != 2 {
                (api.release_session())(session);
                (api.release_session_options())(session_options);
                (api.release_env())(env);
                return Err(OnnxError::ModelLoadFailed(format!(
                    "inpainting model must have 2 inputs (image, mask), found {}",
                    input_count
                )));
            }

            let image_input = owned_name(&api, allocator, |out| {
                (api.session_get_input_name())(session as *const _, 0, allocator, out)
            })
            .unwrap_or_else(|| "image".to_string());
            let mask_input = owned_name(&api, allocator, |out| {
                (api.session_get_input_name())(session as *const _, 1, allocator, out)
            })
            .unwrap_or_else(|| "mask".to_string());
            let output_name = owned_name(&api, allocator, |out| {
                (api.session_get_output_name())(session as *const _, 0, allocator, out)
            })
            .unwrap_or_else(|| "output".to_string());
            eprintln!(
                "[ONNX] Model inputs: '{}', '{}' → output '{}'",
                image_input, mask_input, output_name
            );

            let mut memory_info: *mut OrtMemoryInfo = std::ptr::null_mut();
            if let Err(e) = status_to_result(
                &api,
                (api.create_cpu_memory_info())(
                    OrtAllocatorType::ArenaAllocator,
                    OrtMemType::Default,
                    &mut memory_info,
                ),
            ) {
                (api.release_session())(session);
                (api.release_session_options())(session_options);
                (api.release_env())(env);
                return Err(OnnxError::ApiInitFailed(e));
            }

            Ok(Self {
                api,
                env,
                session_options,
                session,
                memory_info,
                image_input: std::ffi::CString::new(image_input).unwrap_or_default(),
                mask_input: std::ffi::CString::new(mask_input).unwrap_or_default(),
                output_name: std::ffi::CString::new(output_name).unwrap_or_default(),
                _lib: lib,
            })
        }
    }

    fn run_model(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, OnnxError> {
        let (orig_w, orig_h) = image.dimensions();

        // Most inpainting exports want dimensions divisible by 8
        let run_w = orig_w.div_ceil(8) * 8;
        let run_h = orig_h.div_ceil(8) * 8;
        let (scaled_img, scaled_mask) = if (run_w, run_h) != (orig_w, orig_h) {
            (
                image::imageops::resize(image, run_w, run_h, image::imageops::FilterType::Triangle),
                image::imageops::resize(mask, run_w, run_h, image::imageops::FilterType::Nearest),
            )
        } else {
            (image.clone(), mask.clone())
        };

        // CHW float tensors: image in [0,1], mask binary {0,1}
        let npixels = (run_w * run_h) as usize;
        let mut image_data = vec![0.0f32; 3 * npixels];
        for (i, p) in scaled_img.pixels().enumerate() {
            image_data[i] = p.0[0] as f32 / 255.0;
            image_data[npixels + i] = p.0[1] as f32 / 255.0;
            image_data[2 * npixels + i] = p.0[2] as f32 / 255.0;
        }
        let mut mask_data: Vec<f32> = scaled_mask
            .as_raw()
            .iter()
            .map(|&v| if v > 127 { 1.0 } else { 0.0 })
            .collect();

        let image_shape: [i64; 4] = [1, 3, run_h as i64, run_w as i64];
        let mask_shape: [i64; 4] = [1, 1, run_h as i64, run_w as i64];

        unsafe {
            let api = &self.api;
            let mut image_tensor: *mut OrtValue = std::ptr::null_mut();
            status_to_result(
                api,
                (api.create_tensor_with_data())(
                    self.memory_info,
                    image_data.as_mut_ptr() as *mut std::ffi::c_void,
                    image_data.len() * std::mem::size_of::<f32>(),
                    image_shape.as_ptr(),
                    4,
                    ONNXTensorElementDataType::Float,
                    &mut image_tensor,
                ),
            )
            .map_err(OnnxError::InferenceFailed)?;
            let image_guard = ValueGuard {
                api,
                value: image_tensor,
            };

            let mut mask_tensor: *mut OrtValue = std::ptr::null_mut();
            status_to_result(
                api,
                (api.create_tensor_with_data())(
                    self.memory_info,
                    mask_data.as_mut_ptr() as *mut std::ffi::c_void,
                    mask_data.len() * std::mem::size_of::<f32>(),
                    mask_shape.as_ptr(),
                    4,
                    ONNXTensorElementDataType::Float,
                    &mut mask_tensor,
                ),
            )
            .map_err(OnnxError::InferenceFailed)?;
            let mask_guard = ValueGuard {
                api,
                value: mask_tensor,
            };

            let input_names = [self.image_input.as_ptr(), self.mask_input.as_ptr()];
            let inputs = [
                image_guard.value as *const OrtValue,
                mask_guard.value as *const OrtValue,
            ];
            let output_names = [self.output_name.as_ptr()];
            let mut outputs: [*mut OrtValue; 1] = [std::ptr::null_mut()];

            status_to_result(
                api,
                (api.run())(
                    self.session,
                    std::ptr::null(),
                    input_names.as_ptr(),
                    inputs.as_ptr(),
                    2,
                    output_names.as_ptr(),
                    1,
                    outputs.as_mut_ptr(),
                ),
            )
            .map_err(OnnxError::InferenceFailed)?;
            let output_guard = ValueGuard {
                api,
                value: outputs[0],
            };

            // Validate output shape
            let mut shape_info: *mut OrtTensorTypeAndShapeInfo = std::ptr::null_mut();
            status_to_result(
                api,
                (api.get_tensor_type_and_shape())(output_guard.value as *const _, &mut shape_info),
            )
            .map_err(OnnxError::InvalidOutput)?;
            let mut dim_count: usize = 0;
            let _ = status_to_result(api, (api.get_dimensions_count())(shape_info, &mut dim_count));
            let mut dims = vec![0i64; dim_count];
            let _ = status_to_result(
                api,
                (api.get_dimensions())(shape_info, dims.as_mut_ptr(), dim_count),
            );
            (api.release_tensor_type_and_shape_info())(shape_info);

            let (out_h, out_w) = match dims.len() {
                4 => (dims[2] as u32, dims[3] as u32),
                3 => (dims[1] as u32, dims[2] as u32),
                _ => {
                    return Err(OnnxError::InvalidOutput(format!(
                        "unexpected output rank {:?}",
                        dims
                    )));
                }
            };
            if out_h == 0 || out_w == 0 {
                return Err(OnnxError::InvalidOutput(format!(
                    "degenerate output dims {:?}",
                    dims
                )));
            }

            let mut data_ptr: *mut std::ffi::c_void = std::ptr::null_mut();
            status_to_result(
                api,
                (api.get_tensor_mutable_data())(output_guard.value, &mut data_ptr),
            )
            .map_err(OnnxError::InvalidOutput)?;
            if data_ptr.is_null() {
                return Err(OnnxError::InvalidOutput("null output data".to_string()));
            }
            let plane = (out_h * out_w) as usize;
            let out_slice = std::slice::from_raw_parts(data_ptr as *const f32, 3 * plane);

            // Some exports emit [0,1], some [0,255]; normalise by inspection
            let max_val = out_slice.iter().cloned().fold(0.0f32, f32::max);
            let scale = if max_val <= 1.5 { 255.0 } else { 1.0 };

            let mut result = RgbaImage::new(out_w, out_h);
            for (i, p) in result.pixels_mut().enumerate() {
                p.0[0] = (out_slice[i] * scale).clamp(0.0, 255.0) as u8;
                p.0[1] = (out_slice[plane + i] * scale).clamp(0.0, 255.0) as u8;
                p.0[2] = (out_slice[2 * plane + i] * scale).clamp(0.0, 255.0) as u8;
                p.0[3] = 255;
            }

            // Tensors release here via the guards, in reverse order
            drop(output_guard);
            drop(mask_guard);
            drop(image_guard);

            if result.dimensions() != (orig_w, orig_h) {
                Ok(image::imageops::resize(
                    &result,
                    orig_w,
                    orig_h,
                    image::imageops::FilterType::Lanczos3,
                ))
            } else {
                Ok(result)
            }
        }
    }
}

impl InferenceSession for OnnxEraseSession {
    fn name(&self) -> &str {
        "onnx"
    }

    fn erase(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, SessionError> {
        if image.dimensions() != mask.dimensions() {
            return Err(SessionError::InferenceFailed(format!(
                "mask {}x{} does not match image {}x{}",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            )));
        }
        self.run_model(image, mask).map_err(SessionError::from)
    }
}

impl Drop for OnnxEraseSession {
    fn drop(&mut self) {
        // Reverse acquisition order; the library itself unloads afterwards.
        unsafe {
            (self.api.release_memory_info())(self.memory_info);
            (self.api.release_session())(self.session);
            (self.api.release_session_options())(self.session_options);
            (self.api.release_env())(self.env);
        }
    }
}

/// Fetch an ORT-allocated name string and free it through the allocator.
unsafe fn owned_name(
    api: &OrtApi,
    allocator: *mut OrtAllocator,
    get: impl FnOnce(*mut *mut std::ffi::c_char) -> *mut OrtStatus,
) -> Option<String> {
    let mut name_ptr: *mut std::ffi::c_char = std::ptr::null_mut();
    status_to_result(api, get(&mut name_ptr)).ok()?;
    if name_ptr.is_null() {
        return None;
    }
    let s = std::ffi::CStr::from_ptr(name_ptr)
        .to_string_lossy()
        .into_owned();
    let _ = (api.allocator_free())(allocator, name_ptr as *mut std::ffi::c_void);
    Some(s)
}

// ============================================================================
// Tests (path validation only — the runtime itself is external)
// ============================================================================
