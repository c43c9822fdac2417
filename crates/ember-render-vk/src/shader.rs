// SPDX-License-Identifier: CEPL-1.0
//! GLSL to SPIR-V through shaderc.

use ash::vk;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    TessControl,
    TessEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Unknown or combined stages compile as vertex shaders.
    pub fn from_vk(stage: vk::ShaderStageFlags) -> Self {
        match stage {
            vk::ShaderStageFlags::TESSELLATION_CONTROL => Self::TessControl,
            vk::ShaderStageFlags::TESSELLATION_EVALUATION => Self::TessEvaluation,
            vk::ShaderStageFlags::GEOMETRY => Self::Geometry,
            vk::ShaderStageFlags::FRAGMENT => Self::Fragment,
            vk::ShaderStageFlags::COMPUTE => Self::Compute,
            _ => Self::Vertex,
        }
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Vertex => "shader.vert",
            Self::TessControl => "shader.tesc",
            Self::TessEvaluation => "shader.tese",
            Self::Geometry => "shader.geom",
            Self::Fragment => "shader.frag",
            Self::Compute => "shader.comp",
        }
    }
}

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("shader compiler unavailable: {0}")]
    Init(String),
    #[error("failed to compile {stage:?} shader:\n{log}")]
    Compile { stage: ShaderStage, log: String },
}

/// Holds one shaderc compiler for the life of the process. Compilation is
/// synchronous and keeps no state between calls.
#[cfg(feature = "shaderc")]
pub struct ShaderCompiler {
    compiler: shaderc::Compiler,
}

#[cfg(feature = "shaderc")]
impl ShaderCompiler {
    pub fn new() -> Result<Self, ShaderError> {
        let compiler = shaderc::Compiler::new().map_err(|e| ShaderError::Init(e.to_string()))?;
        Ok(Self { compiler })
    }

    /// Compiles GLSL `source` for Vulkan 1.0. The error carries the
    /// compiler's diagnostics.
    pub fn compile(&self, stage: ShaderStage, source: &str) -> Result<Vec<u32>, ShaderError> {
        let mut options =
            shaderc::CompileOptions::new().map_err(|e| ShaderError::Init(e.to_string()))?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_0 as u32,
        );
        let kind = match stage {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::TessControl => shaderc::ShaderKind::TessControl,
            ShaderStage::TessEvaluation => shaderc::ShaderKind::TessEvaluation,
            ShaderStage::Geometry => shaderc::ShaderKind::Geometry,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        };
        let artifact = self
            .compiler
            .compile_into_spirv(source, kind, stage.file_name(), "main", Some(&options))
            .map_err(|e| ShaderError::Compile {
                stage,
                log: e.to_string(),
            })?;
        if artifact.get_num_warnings() > 0 {
            tracing::warn!("{}", artifact.get_warning_messages());
        }
        Ok(artifact.as_binary().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_mapping() {
        assert_eq!(ShaderStage::from_vk(vk::ShaderStageFlags::FRAGMENT), ShaderStage::Fragment);
        assert_eq!(ShaderStage::from_vk(vk::ShaderStageFlags::COMPUTE), ShaderStage::Compute);
        assert_eq!(
            ShaderStage::from_vk(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT),
            ShaderStage::Vertex
        );
        assert_eq!(ShaderStage::Geometry.to_vk(), vk::ShaderStageFlags::GEOMETRY);
    }

    #[cfg(feature = "shaderc")]
    #[test]
    fn compiles_glsl_and_reports_errors() {
        const SPIRV_MAGIC: u32 = 0x0723_0203;
        let compiler = ShaderCompiler::new().unwrap();
        let ok = compiler
            .compile(
                ShaderStage::Fragment,
                "#version 450\nlayout(location = 0) out vec4 o;\nvoid main() { o = vec4(1.0); }\n",
            )
            .unwrap();
        assert_eq!(ok[0], SPIRV_MAGIC);

        let err = compiler
            .compile(ShaderStage::Vertex, "#version 450\nvoid main() { nope }\n")
            .unwrap_err();
        match err {
            ShaderError::Compile { stage, log } => {
                assert_eq!(stage, ShaderStage::Vertex);
                assert!(!log.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
