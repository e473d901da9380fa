use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    let dest = env::var("OUT_DIR").unwrap();
    let spirv_dir = Path::new(&dest).join("spirv");
    fs::create_dir_all(&spirv_dir).unwrap();

    // The renderer defaults to loading shaders from here
    println!("cargo:rustc-env=RTSCENE_SHADER_DIR={}", spirv_dir.display());
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    // ========================================================================
    // SPIR-V Shader Compilation (via glslc from Vulkan SDK)
    // ========================================================================
    // Ray tracing stages need SPIR-V 1.4, which Vulkan 1.2 accepts.
    let shader_dir = Path::new("shaders");
    if !shader_dir.exists() {
        return;
    }

    // Format: (source, output, stage) - stages use glslc abbreviations
    let rt_shaders = [
        ("raygen.rgen.glsl", "raygen.rgen.spv", "rgen"),
        ("miss.rmiss.glsl", "miss.rmiss.spv", "rmiss"),
        ("shadow.rmiss.glsl", "shadow.rmiss.spv", "rmiss"),
        ("closesthit.rchit.glsl", "closesthit.rchit.spv", "rchit"),
    ];

    for (filename, _, _) in &rt_shaders {
        println!("cargo:rerun-if-changed=shaders/{filename}");
    }

    let glslc = match find_glslc() {
        Some(path) => path,
        None => {
            println!(
                "cargo:warning=glslc not found; shaders were not compiled. \
                 Install the Vulkan SDK or pass --shaders with prebuilt SPIR-V."
            );
            return;
        }
    };

    println!("cargo:warning=Using glslc: {}", glslc.display());

    let mut any_failed = false;
    for (filename, spv_name, stage) in &rt_shaders {
        let src_path = shader_dir.join(filename);
        let spv_path = spirv_dir.join(spv_name);
        any_failed |= !compile_shader(&glslc, &src_path, &spv_path, stage, filename);
    }

    if any_failed {
        panic!("Some shaders failed to compile (see warnings above)");
    }
}

/// Compile a single shader file to SPIR-V.
fn compile_shader(glslc: &Path, src_path: &Path, spv_path: &Path, stage: &str, filename: &str) -> bool {
    let output = Command::new(glslc)
        .arg(format!("-fshader-stage={stage}"))
        .args(["--target-env=vulkan1.2", "--target-spv=spv1.4", "-O", "-o"])
        .arg(spv_path)
        .arg(src_path)
        .output();

    match output {
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if result.status.success() {
                if !stderr.is_empty() {
                    println!("cargo:warning=glslc {filename}: {stderr}");
                }
                true
            } else {
                println!("cargo:warning=glslc FAILED {filename}: {stderr}");
                false
            }
        }
        Err(e) => {
            println!("cargo:warning=glslc: failed to run for {filename}: {e}");
            false
        }
    }
}

/// Find glslc binary: check PATH, then VULKAN_SDK.
fn find_glslc() -> Option<PathBuf> {
    if let Ok(output) = Command::new("glslc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("glslc"));
        }
    }

    let sdk = env::var("VULKAN_SDK").ok()?;
    [
        PathBuf::from(&sdk).join("bin").join("glslc"),
        PathBuf::from(&sdk).join("Bin").join("glslc.exe"),
    ]
    .into_iter()
    .find(|path| path.exists())
}
