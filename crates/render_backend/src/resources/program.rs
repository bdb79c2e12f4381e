//! Program resource wrapper and shader reflection.

use crate::api::info::{
    PipelineStage, SamplerBindingInfo, ShaderCreateInfo, UniformBlockInfo,
};
use crate::driver::{ShaderId, StageDesc};
use crate::error::{BackendError, BackendResult};
use crate::resources::LifecycleState;

/// GPU-side layout facts of a linked program, assembled from the stage
/// create-infos at link time. The rendering core queries this instead of
/// dictating binding points itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramReflection {
    /// Uniform blocks across all stages, deduplicated by binding.
    pub uniform_blocks: Vec<UniformBlockInfo>,
    /// Samplers across all stages, deduplicated by binding.
    pub samplers: Vec<SamplerBindingInfo>,
}

impl ProgramReflection {
    /// Merges one stage's declarations in.
    fn absorb(&mut self, info: &ShaderCreateInfo) {
        for block in &info.uniform_blocks {
            if !self.uniform_blocks.iter().any(|b| b.binding == block.binding) {
                self.uniform_blocks.push(block.clone());
            }
        }
        for sampler in &info.samplers {
            if !self.samplers.iter().any(|s| s.binding == sampler.binding) {
                self.samplers.push(sampler.clone());
            }
        }
    }

    /// Looks up a uniform block by name.
    pub fn uniform_block(&self, name: &str) -> Option<&UniformBlockInfo> {
        self.uniform_blocks.iter().find(|b| b.name == name)
    }

    /// Byte offset of a member within a named block.
    pub fn member_offset(&self, block: &str, member: &str) -> Option<u32> {
        self.uniform_block(block)?
            .members
            .iter()
            .find(|m| m.name == member)
            .map(|m| m.offset)
    }

    /// Descriptor binding of a named sampler.
    pub fn sampler_binding(&self, name: &str) -> Option<u32> {
        self.samplers.iter().find(|s| s.name == name).map(|s| s.binding)
    }
}

/// A linked program owned by the controller. Programs own no driver
/// objects of their own; they bundle stage modules and reflection for
/// pipeline compiles.
#[derive(Debug)]
pub struct ProgramResource {
    name: String,
    stages: Vec<StageDesc>,
    reflection: ProgramReflection,
    state: LifecycleState,
}

impl ProgramResource {
    /// Links resolved stages into a program. `stages` pairs each stage's
    /// create-info with its compiled module.
    pub fn link(
        name: String,
        stages: Vec<(ShaderCreateInfo, ShaderId)>,
    ) -> BackendResult<Self> {
        if stages.is_empty() {
            return Err(BackendError::invalid("program links no stages"));
        }
        let mut reflection = ProgramReflection::default();
        let mut stage_descs = Vec::with_capacity(stages.len());
        for (info, module) in stages {
            let stage = info
                .stage
                .ok_or_else(|| BackendError::invalid("program stage missing a stage tag"))?;
            if stage_descs.iter().any(|s: &StageDesc| s.stage == stage) {
                return Err(BackendError::invalid("program links a stage twice"));
            }
            reflection.absorb(&info);
            stage_descs.push(StageDesc {
                stage,
                module,
                entry_point: if info.entry_point.is_empty() {
                    "main".to_owned()
                } else {
                    info.entry_point
                },
            });
        }
        Ok(ProgramResource {
            name,
            stages: stage_descs,
            reflection,
            state: LifecycleState::Live,
        })
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage descriptors for pipeline compiles.
    pub fn stages(&self) -> &[StageDesc] {
        &self.stages
    }

    /// The module occupying `stage`, if linked.
    pub fn stage_module(&self, stage: PipelineStage) -> Option<ShaderId> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| s.module)
    }

    /// Reflection view.
    pub fn reflection(&self) -> &ProgramReflection {
        &self.reflection
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::info::UniformMemberInfo;
    use slotmap::KeyData;

    fn shader_with_block(stage: PipelineStage, binding: u32) -> ShaderCreateInfo {
        ShaderCreateInfo {
            stage: Some(stage),
            source: vec![0x03, 0x02, 0x23, 0x07],
            entry_point: "main".into(),
            uniform_blocks: vec![UniformBlockInfo {
                name: format!("block{binding}"),
                binding,
                size: 64,
                members: vec![UniformMemberInfo {
                    name: "color".into(),
                    offset: 16,
                    size: 16,
                }],
            }],
            samplers: vec![SamplerBindingInfo { name: "albedo".into(), binding: 2 }],
        }
    }

    fn module(raw: u64) -> ShaderId {
        ShaderId::from(KeyData::from_ffi(raw))
    }

    #[test]
    fn test_link_merges_reflection_across_stages() {
        let program = ProgramResource::link(
            "lit".into(),
            vec![
                (shader_with_block(PipelineStage::Vertex, 0), module(1)),
                (shader_with_block(PipelineStage::Fragment, 1), module(2)),
            ],
        )
        .unwrap();

        assert_eq!(program.reflection().uniform_blocks.len(), 2);
        assert_eq!(program.reflection().samplers.len(), 1);
        assert_eq!(program.reflection().member_offset("block1", "color"), Some(16));
        assert_eq!(program.reflection().sampler_binding("albedo"), Some(2));
        assert!(program.stage_module(PipelineStage::Fragment).is_some());
    }

    #[test]
    fn test_link_rejects_duplicate_and_missing_stage() {
        let duplicate = ProgramResource::link(
            "bad".into(),
            vec![
                (shader_with_block(PipelineStage::Vertex, 0), module(1)),
                (shader_with_block(PipelineStage::Vertex, 1), module(2)),
            ],
        );
        assert!(duplicate.is_err());

        let untagged = ProgramResource::link(
            "bad".into(),
            vec![(
                ShaderCreateInfo { stage: None, ..shader_with_block(PipelineStage::Vertex, 0) },
                module(1),
            )],
        );
        assert!(untagged.is_err());
        assert!(ProgramResource::link("empty".into(), vec![]).is_err());
    }
}
