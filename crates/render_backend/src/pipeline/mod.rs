//! Pipeline objects and their compiled-variant cache.
//!
//! A pipeline bakes the stable parts of its state once and treats
//! depth/stencil as the frequently-changing axis: when left dynamic at
//! creation, each distinct depth/stencil value seen at draw time compiles
//! (and caches) one native variant. Variants are keyed by the 32-bit state
//! hash with full struct equality confirming every hit, and are pruned
//! when their originating render pass stops being compatible with the pass
//! currently drawn into.

pub mod cache;

pub use cache::PipelineCacheManager;

use std::collections::HashMap;

use crate::api::handles::{ProgramHandle, RenderPassHandle, RenderTargetHandle};
use crate::api::info::PipelineCreateInfo;
use crate::api::state::{
    ColorBlendState, DepthStencilState, InputAssemblyState, MultisampleState, RasterizationState,
    VertexInputState, ViewportState,
};
use crate::driver::{GpuDriver, PipelineDesc, PipelineId, RenderPassId, StageDesc};
use crate::error::{BackendError, BackendResult};
use crate::resources::LifecycleState;

/// Upper bound on cached variants per pipeline; the least recently used
/// entry is evicted past this.
const MAX_CACHED_VARIANTS: usize = 16;

/// Sub-states copied out of a transient create-info into pipeline-owned
/// storage. `viewport` and `depth_stencil` stay `None` when declared
/// dynamic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OwnedPipelineState {
    /// Vertex input layout.
    pub vertex_input: VertexInputState,
    /// Primitive assembly.
    pub input_assembly: InputAssemblyState,
    /// Rasterizer configuration.
    pub rasterization: RasterizationState,
    /// Static viewport, or dynamic when absent.
    pub viewport: Option<ViewportState>,
    /// Static depth/stencil, or dynamic when absent.
    pub depth_stencil: Option<DepthStencilState>,
    /// Blend configuration.
    pub color_blend: ColorBlendState,
    /// Multisample configuration.
    pub multisample: MultisampleState,
}

impl OwnedPipelineState {
    /// Copies every referenced sub-state out of the create-info.
    pub fn capture(info: &PipelineCreateInfo<'_>) -> Self {
        OwnedPipelineState {
            vertex_input: info.vertex_input_state.cloned().unwrap_or_default(),
            input_assembly: info.input_assembly_state.copied().unwrap_or_default(),
            rasterization: info.rasterization_state.copied().unwrap_or_default(),
            viewport: info.viewport_state.copied(),
            depth_stencil: info.depth_stencil_state.copied(),
            color_blend: info.color_blend_state.copied().unwrap_or_default(),
            multisample: info.multisample_state.copied().unwrap_or_default(),
        }
    }

    /// 32-bit mix over the whole bundle, for fast whole-pipeline
    /// comparisons. Equality remains the authoritative test.
    pub fn state_hash(&self) -> u32 {
        let mut h = self.vertex_input.mix(0);
        h = self.input_assembly.mix(h);
        h = self.rasterization.mix(h);
        if let Some(viewport) = &self.viewport {
            h = viewport.mix(h);
        }
        if let Some(depth_stencil) = &self.depth_stencil {
            h = crate::api::state::hash_combine(h, depth_stencil.state_hash());
        }
        h = self.color_blend.mix(h);
        self.multisample.mix(h)
    }
}

#[derive(Debug)]
struct CompiledVariant {
    native: PipelineId,
    render_pass: RenderPassHandle,
    last_used: u64,
}

/// A pipeline owned by the controller.
#[derive(Debug)]
pub struct PipelineResource {
    program: ProgramHandle,
    render_target: RenderTargetHandle,
    owned: OwnedPipelineState,
    stages: Vec<StageDesc>,
    variants: HashMap<DepthStencilState, CompiledVariant>,
    use_tick: u64,
    state: LifecycleState,
}

impl PipelineResource {
    /// Captures a create-info; stages are the program's resolved modules.
    pub fn new(info: &PipelineCreateInfo<'_>, stages: Vec<StageDesc>) -> Self {
        PipelineResource {
            program: info.program,
            render_target: info.render_target,
            owned: OwnedPipelineState::capture(info),
            stages,
            variants: HashMap::new(),
            use_tick: 0,
            state: LifecycleState::PendingCreate,
        }
    }

    /// The program this pipeline draws with.
    pub fn program(&self) -> ProgramHandle {
        self.program
    }

    /// The render target this pipeline was declared against.
    pub fn render_target(&self) -> RenderTargetHandle {
        self.render_target
    }

    /// The owned sub-state bundle.
    pub fn owned_state(&self) -> &OwnedPipelineState {
        &self.owned
    }

    /// Whether depth/stencil resolves per draw instead of at creation.
    pub fn is_depth_stencil_dynamic(&self) -> bool {
        self.owned.depth_stencil.is_none()
    }

    /// Compiled variants currently cached.
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Whether another create-info describes the same pipeline, making its
    /// compiled variants reusable as-is.
    pub fn matches_create_info(&self, info: &PipelineCreateInfo<'_>) -> bool {
        self.program == info.program
            && self.render_target == info.render_target
            && self.owned == OwnedPipelineState::capture(info)
    }

    /// Compiles the initial variant for a static depth/stencil pipeline.
    /// Dynamic pipelines compile nothing until a draw requests a state.
    pub fn initialize(
        &mut self,
        driver: &dyn GpuDriver,
        cache: &mut PipelineCacheManager,
        render_pass: RenderPassHandle,
        render_pass_id: RenderPassId,
    ) -> BackendResult<()> {
        self.state = LifecycleState::Live;
        match self.owned.depth_stencil {
            Some(depth_stencil) => self
                .compile_variant(depth_stencil, render_pass, render_pass_id, driver, cache)
                .map(|_| ()),
            None => Ok(()),
        }
    }

    /// Returns a compiled native handle valid for the render pass currently
    /// drawn into.
    ///
    /// Cached variants whose originating pass is no longer compatible (as
    /// judged by `pass_compatible`) are pruned and released before any
    /// lookup or compile. For static pipelines `requested` is ignored in
    /// favor of the baked state.
    pub fn native_for(
        &mut self,
        requested: &DepthStencilState,
        current_pass: RenderPassHandle,
        current_pass_id: RenderPassId,
        pass_compatible: impl Fn(RenderPassHandle) -> bool,
        driver: &dyn GpuDriver,
        cache: &mut PipelineCacheManager,
    ) -> BackendResult<PipelineId> {
        self.prune_incompatible(&pass_compatible, driver, cache);

        let key = self.owned.depth_stencil.unwrap_or(*requested);
        self.use_tick += 1;
        if let Some(variant) = self.variants.get_mut(&key) {
            variant.last_used = self.use_tick;
            cache.note_hit();
            return Ok(variant.native);
        }
        self.compile_variant(key, current_pass, current_pass_id, driver, cache)
    }

    fn prune_incompatible(
        &mut self,
        pass_compatible: &impl Fn(RenderPassHandle) -> bool,
        driver: &dyn GpuDriver,
        cache: &mut PipelineCacheManager,
    ) {
        let stale: Vec<DepthStencilState> = self
            .variants
            .iter()
            .filter(|(_, v)| !pass_compatible(v.render_pass))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(variant) = self.variants.remove(&key) {
                log::trace!("pruning pipeline variant compiled for a stale render pass");
                cache.release(driver, variant.native);
            }
        }
    }

    fn compile_variant(
        &mut self,
        depth_stencil: DepthStencilState,
        render_pass: RenderPassHandle,
        render_pass_id: RenderPassId,
        driver: &dyn GpuDriver,
        cache: &mut PipelineCacheManager,
    ) -> BackendResult<PipelineId> {
        if self.stages.is_empty() {
            return Err(BackendError::invalid("pipeline compiled without stages"));
        }
        if self.variants.len() >= MAX_CACHED_VARIANTS {
            self.evict_least_recent(driver, cache);
        }

        let native = cache.compile(
            driver,
            &PipelineDesc {
                stages: self.stages.clone(),
                vertex_input: self.owned.vertex_input.clone(),
                input_assembly: self.owned.input_assembly,
                rasterization: self.owned.rasterization,
                viewport: self.owned.viewport,
                depth_stencil,
                color_blend: self.owned.color_blend,
                multisample: self.owned.multisample,
                render_pass: render_pass_id,
            },
        )?;

        self.use_tick += 1;
        self.variants.insert(
            depth_stencil,
            CompiledVariant {
                native,
                render_pass,
                last_used: self.use_tick,
            },
        );
        Ok(native)
    }

    fn evict_least_recent(&mut self, driver: &dyn GpuDriver, cache: &mut PipelineCacheManager) {
        let oldest = self
            .variants
            .iter()
            .min_by_key(|(_, v)| v.last_used)
            .map(|(k, _)| *k);
        if let Some(key) = oldest {
            if let Some(variant) = self.variants.remove(&key) {
                cache.release(driver, variant.native);
            }
        }
    }

    /// Destroys every compiled variant, through the shared manager when one
    /// exists so its bookkeeping stays correct.
    pub fn destroy(&mut self, driver: &dyn GpuDriver, cache: Option<&mut PipelineCacheManager>) {
        match cache {
            Some(cache) => {
                for (_, variant) in self.variants.drain() {
                    cache.release(driver, variant.native);
                }
            }
            None => {
                for (_, variant) in self.variants.drain() {
                    driver.destroy_pipeline(variant.native);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::state::colliding_depth_stencil_pair;
    use crate::driver::recording::RecordingDriver;
    use slotmap::KeyData;

    fn pass(raw: u64) -> RenderPassHandle {
        RenderPassHandle::from(KeyData::from_ffi(raw))
    }

    fn dynamic_pipeline() -> PipelineResource {
        let info = PipelineCreateInfo {
            program: ProgramHandle::default(),
            vertex_input_state: None,
            input_assembly_state: None,
            rasterization_state: None,
            viewport_state: None,
            depth_stencil_state: None,
            color_blend_state: None,
            multisample_state: None,
            render_target: RenderTargetHandle::default(),
        };
        let stages = vec![StageDesc {
            stage: crate::api::info::PipelineStage::Vertex,
            module: Default::default(),
            entry_point: "main".into(),
        }];
        PipelineResource::new(&info, stages)
    }

    fn depth_on() -> DepthStencilState {
        DepthStencilState { depth_test_enable: true, ..Default::default() }
    }

    #[test]
    fn test_static_pipeline_compiles_once_and_ignores_requests() {
        let driver = RecordingDriver::new();
        let mut cache = PipelineCacheManager::new();
        let baked = depth_on();

        let owned_state = OwnedPipelineState { depth_stencil: Some(baked), ..Default::default() };
        let mut pipeline = dynamic_pipeline();
        pipeline.owned = owned_state;
        let pass_id = driver.make_render_pass();
        pipeline.initialize(&driver, &mut cache, pass(1), pass_id).unwrap();
        assert_eq!(cache.compiled_count(), 1);

        let other = DepthStencilState::default();
        let native_a = pipeline
            .native_for(&other, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        let native_b = pipeline
            .native_for(&baked, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        assert_eq!(native_a, native_b);
        assert_eq!(cache.compiled_count(), 1);
        assert_eq!(pipeline.variant_count(), 1);
    }

    #[test]
    fn test_dynamic_variants_cached_by_state() {
        let driver = RecordingDriver::new();
        let mut cache = PipelineCacheManager::new();
        let mut pipeline = dynamic_pipeline();
        let pass_id = driver.make_render_pass();
        pipeline.initialize(&driver, &mut cache, pass(1), pass_id).unwrap();
        assert_eq!(cache.compiled_count(), 0, "dynamic pipeline compiles lazily");

        let with_depth = depth_on();
        let without_depth = DepthStencilState::default();

        let a = pipeline
            .native_for(&with_depth, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        let b = pipeline
            .native_for(&without_depth, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(pipeline.variant_count(), 2);

        let c = pipeline
            .native_for(&with_depth, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        assert_eq!(a, c, "repeating a state must reuse its variant");
        assert_eq!(cache.compiled_count(), 2);
        assert_eq!(cache.hit_count(), 1);
    }

    #[test]
    fn test_hash_collision_never_conflates_variants() {
        let (first, second) = colliding_depth_stencil_pair();
        assert_eq!(first.state_hash(), second.state_hash());

        let driver = RecordingDriver::new();
        let mut cache = PipelineCacheManager::new();
        let mut pipeline = dynamic_pipeline();
        let pass_id = driver.make_render_pass();
        pipeline.initialize(&driver, &mut cache, pass(1), pass_id).unwrap();

        let a = pipeline
            .native_for(&first, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        let b = pipeline
            .native_for(&second, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        assert_ne!(a, b, "hash equality alone must never produce a cache hit");
        assert_eq!(cache.compiled_count(), 2);
        assert_eq!(pipeline.variant_count(), 2);
    }

    #[test]
    fn test_incompatible_pass_prunes_exactly_once_before_compile() {
        let driver = RecordingDriver::new();
        let mut cache = PipelineCacheManager::new();
        let mut pipeline = dynamic_pipeline();
        let pass_a_id = driver.make_render_pass();
        let pass_b_id = driver.make_render_pass();
        pipeline.initialize(&driver, &mut cache, pass(1), pass_a_id).unwrap();

        let state = depth_on();
        pipeline
            .native_for(&state, pass(1), pass_a_id, |_| true, &driver, &mut cache)
            .unwrap();
        assert_eq!(pipeline.variant_count(), 1);

        // Switch to a pass incompatible with everything cached so far.
        let only_b = |h: RenderPassHandle| h == pass(2);
        pipeline
            .native_for(&state, pass(2), pass_b_id, only_b, &driver, &mut cache)
            .unwrap();
        assert_eq!(pipeline.variant_count(), 1);
        assert_eq!(cache.released_count(), 1);
        assert_eq!(driver.destroyed_pipelines(), 1);
        assert_eq!(cache.compiled_count(), 2);
    }

    #[test]
    fn test_variant_cache_evicts_least_recent_at_capacity() {
        let driver = RecordingDriver::new();
        let mut cache = PipelineCacheManager::new();
        let mut pipeline = dynamic_pipeline();
        let pass_id = driver.make_render_pass();
        pipeline.initialize(&driver, &mut cache, pass(1), pass_id).unwrap();

        for reference in 0..(MAX_CACHED_VARIANTS as u32 + 1) {
            let mut state = DepthStencilState::default();
            state.front.reference = reference;
            pipeline
                .native_for(&state, pass(1), pass_id, |_| true, &driver, &mut cache)
                .unwrap();
        }
        assert_eq!(pipeline.variant_count(), MAX_CACHED_VARIANTS);
        assert_eq!(cache.released_count(), 1);

        // The first-inserted state was the least recently used.
        let mut evicted = DepthStencilState::default();
        evicted.front.reference = 0;
        pipeline
            .native_for(&evicted, pass(1), pass_id, |_| true, &driver, &mut cache)
            .unwrap();
        assert_eq!(
            cache.compiled_count(),
            MAX_CACHED_VARIANTS as u64 + 2,
            "evicted state must recompile"
        );
    }

    #[test]
    fn test_destroy_releases_all_variants_through_manager() {
        let driver = RecordingDriver::new();
        let mut cache = PipelineCacheManager::new();
        let mut pipeline = dynamic_pipeline();
        let pass_id = driver.make_render_pass();
        pipeline.initialize(&driver, &mut cache, pass(1), pass_id).unwrap();

        for reference in 0..3u32 {
            let mut state = DepthStencilState::default();
            state.front.reference = reference;
            pipeline
                .native_for(&state, pass(1), pass_id, |_| true, &driver, &mut cache)
                .unwrap();
        }
        pipeline.destroy(&driver, Some(&mut cache));
        assert_eq!(pipeline.variant_count(), 0);
        assert_eq!(cache.live_count(), 0);
        assert_eq!(driver.destroyed_pipelines(), 3);
    }
}
