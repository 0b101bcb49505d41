use std::{env, fs, path::PathBuf};

// Matches the pipeline's vertex layout:
//   - binding 0, location 0: R32G32_SFLOAT (pixel position)
//   - binding 0, location 1: R32G32B32_SFLOAT (color)
// and the per-image uniform block at set 0, binding 0.
const VERT_SRC: &str = r#"
#version 450
layout(set = 0, binding = 0) uniform Transforms {
    mat4 model;
    mat4 view;
    mat4 proj;
} u;

layout(location = 0) in vec2 inPos;
layout(location = 1) in vec3 inColor;

layout(location = 0) out vec3 vColor;

void main() {
    vColor = inColor;
    gl_Position = u.proj * u.view * u.model * vec4(inPos, 0.0, 1.0);
}
"#;

const FRAG_SRC: &str = r#"
#version 450
layout(location = 0) in vec3 vColor;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vColor, 1.0);
}
"#;

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));

    let comp = shaderc::Compiler::new().expect("shaderc compiler");
    let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (src, kind, name, file) in [
        (VERT_SRC, shaderc::ShaderKind::Vertex, "tile.vert", "vert.spv"),
        (FRAG_SRC, shaderc::ShaderKind::Fragment, "tile.frag", "frag.spv"),
    ] {
        let spv = comp
            .compile_into_spirv(src, kind, name, "main", Some(&opts))
            .unwrap_or_else(|e| panic!("compiling {name}: {e}"));
        fs::write(out.join(file), spv.as_binary_u8())
            .unwrap_or_else(|e| panic!("writing {file}: {e}"));
    }

    println!("cargo:rerun-if-changed=build.rs");
}
