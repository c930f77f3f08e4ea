use std::collections::{BTreeSet, HashSet};

use shadertoy::{PassId, RenderPass, ShaderDescription};
use tracing::{debug, warn};

use crate::channels::{ChannelKind, CHANNEL_COUNT};
use crate::compile::{
    check_stage_interface, lower_to_spirv, parse_to_ir, synthesize_source, vertex_ir,
    ShaderCompiler, SourceOptions,
};
use crate::error::BuildError;
use crate::pipeline::{CompiledPass, PassCompiler, PassTarget};

use super::{GraphNode, RenderGraph};

/// Where a channel's texture comes from once the graph is live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelSource {
    #[default]
    Unbound,
    /// Output of the pass with this id.
    Pass(PassId),
    /// Image referenced by a `texture` input's `src`.
    Asset { src: String },
    /// Declared, but nothing the engine can feed it.
    Placeholder,
}

/// One graph pass before compilation.
#[derive(Debug, Clone)]
pub struct PassSpec {
    pub code: String,
    pub channels: [ChannelSource; CHANNEL_COUNT],
    pub kinds: [ChannelKind; CHANNEL_COUNT],
    pub presents: bool,
}

/// One graph pass after compilation.
pub struct CompiledNode {
    pub pass: CompiledPass,
    pub channels: [ChannelSource; CHANNEL_COUNT],
    pub presents: bool,
}

/// Validated topology plus the shared source every pass is compiled with.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    pub graph: RenderGraph<PassSpec>,
    pub common: String,
}

impl GraphPlan {
    /// Distinct asset `src` values referenced by any pass.
    pub fn asset_sources(&self) -> BTreeSet<String> {
        self.graph
            .nodes()
            .iter()
            .flat_map(|node| node.payload.channels.iter())
            .filter_map(|channel| match channel {
                ChannelSource::Asset { src } => Some(src.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn presentation_index(&self) -> Option<usize> {
        self.graph
            .nodes()
            .iter()
            .position(|node| node.payload.presents)
    }
}

/// Turns a description into a graph plan without touching the GPU.
///
/// Unsupported inputs fail here, before any pass is compiled.
pub fn plan_graph(description: &ShaderDescription) -> Result<GraphPlan, BuildError> {
    let issues = description.validate();
    if !issues.is_empty() {
        return Err(BuildError::InvalidArgument(issues.join("; ")));
    }

    let common = description.common_code();
    let passes: Vec<&RenderPass> = description.graph_passes().collect();
    let presentation = passes
        .iter()
        .position(|pass| pass.is_image())
        .unwrap_or(passes.len().saturating_sub(1));

    let mut outputs = HashSet::with_capacity(passes.len());
    for pass in &passes {
        let output = pass.output_id().ok_or_else(|| {
            BuildError::InvalidArgument(format!("pass '{}' declares no output", pass.name))
        })?;
        outputs.insert(output);
    }
    let presentation_output = passes[presentation].output_id();

    let mut nodes = Vec::with_capacity(passes.len());
    for (index, pass) in passes.iter().enumerate() {
        let output_id = pass.output_id().ok_or_else(|| {
            BuildError::InvalidArgument(format!("pass '{}' declares no output", pass.name))
        })?;
        let mut channels: [ChannelSource; CHANNEL_COUNT] = Default::default();
        let mut kinds = [ChannelKind::default(); CHANNEL_COUNT];
        let mut input_ids = Vec::with_capacity(pass.inputs.len());

        for input in &pass.inputs {
            let kind = ChannelKind::from_ctype(&input.channel_type).ok_or_else(|| {
                BuildError::UnsupportedInput {
                    pass: pass.name.clone(),
                    channel: input.channel,
                    ctype: input.channel_type.clone(),
                }
            })?;
            let slot = usize::from(input.channel);
            if slot >= CHANNEL_COUNT {
                return Err(BuildError::InvalidArgument(format!(
                    "pass '{}' uses channel {}",
                    pass.name, input.channel
                )));
            }
            if channels[slot] != ChannelSource::Unbound {
                warn!(
                    pass = %pass.name,
                    channel = slot,
                    "channel declared twice; keeping the first input"
                );
                continue;
            }
            if let Some(id) = input.id {
                input_ids.push(id);
            }

            let reads_pass = input.id.filter(|id| outputs.contains(id));
            channels[slot] = match (reads_pass, kind) {
                (Some(id), ChannelKind::Texture2d) if Some(id) == presentation_output => {
                    warn!(
                        pass = %pass.name,
                        channel = slot,
                        "presentation output cannot be sampled; binding placeholder"
                    );
                    ChannelSource::Placeholder
                }
                (Some(id), ChannelKind::Texture2d) => ChannelSource::Pass(id),
                _ => match input.src.as_deref() {
                    Some(src) if kind == ChannelKind::Texture2d && !src.trim().is_empty() => {
                        ChannelSource::Asset {
                            src: src.trim().to_string(),
                        }
                    }
                    _ => ChannelSource::Placeholder,
                },
            };
            kinds[slot] = kind;
        }

        nodes.push(GraphNode {
            name: pass.name.clone(),
            output_id,
            input_ids,
            payload: PassSpec {
                code: pass.code.clone(),
                channels,
                kinds,
                presents: index == presentation,
            },
        });
    }

    let graph = RenderGraph::from_nodes(nodes)?;
    debug!(
        passes = graph.len(),
        edges = graph.edges().count(),
        presentation = %graph.nodes()[presentation].name,
        "planned render graph"
    );
    Ok(GraphPlan { graph, common })
}

/// Compiles every planned pass. The first failure aborts the whole build.
pub fn compile_graph(
    plan: GraphPlan,
    compiler: &PassCompiler,
    presentation_format: wgpu::TextureFormat,
) -> Result<RenderGraph<CompiledNode>, BuildError> {
    let GraphPlan { graph, common } = plan;
    graph.try_map(|_, meta, spec| {
        let target = if spec.presents {
            PassTarget::Presentation(presentation_format)
        } else {
            PassTarget::Offscreen
        };
        let pass = compiler.compile_pass(&meta.name, &common, &spec.code, spec.kinds, target)?;
        Ok(CompiledNode {
            pass,
            channels: spec.channels,
            presents: spec.presents,
        })
    })
}

/// SPIR-V for one planned pass, produced without a device.
#[derive(Debug, Clone)]
pub struct LoweredPass {
    pub name: String,
    pub words: Vec<u32>,
}

/// Runs both compile stages over every pass in execution order and checks
/// each fragment stage against the shared vertex stage. Binding layouts and
/// target formats are only validated when a device builds the pipelines.
pub fn lower_plan(
    plan: &GraphPlan,
    compiler: ShaderCompiler,
) -> Result<Vec<LoweredPass>, BuildError> {
    let vertex = vertex_ir()?;
    plan.graph
        .order()
        .iter()
        .map(|&index| {
            let node = &plan.graph.nodes()[index];
            let options = SourceOptions {
                channel_kinds: node.payload.kinds,
                flip_y: node.payload.presents,
            };
            let source = synthesize_source(&plan.common, &node.payload.code, &options);
            let ir = parse_to_ir(&node.name, &source, compiler)?;
            check_stage_interface(&node.name, &vertex, &ir)?;
            let words = lower_to_spirv(&node.name, &ir)?;
            Ok(LoweredPass {
                name: node.name.clone(),
                words,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use shadertoy::parse_description;

    use super::*;

    const MAIN: &str = "void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }";

    fn describe(passes: &str) -> ShaderDescription {
        parse_description(&format!(r#"{{ "renderpass": [ {passes} ] }}"#)).unwrap()
    }

    fn pass(name: &str, output: i64, inputs: &str) -> String {
        format!(
            r#"{{ "name": "{name}", "type": "buffer", "code": "{MAIN}", "inputs": [ {inputs} ], "outputs": [ {{ "id": {output} }} ] }}"#
        )
    }

    fn buffer_input(id: i64, channel: u8) -> String {
        format!(r#"{{ "id": {id}, "channel": {channel}, "ctype": "buffer" }}"#)
    }

    #[test]
    fn consumer_gets_an_edge_from_its_producer() {
        let description = describe(&format!(
            "{}, {}",
            pass("A", 0, ""),
            pass("B", 1, &buffer_input(0, 0))
        ));
        let plan = plan_graph(&description).unwrap();
        assert_eq!(
            plan.graph.edge_ids().into_iter().collect::<Vec<_>>(),
            vec![(PassId(0), PassId(1))]
        );
        assert_eq!(plan.graph.order(), &[0, 1]);
        assert_eq!(
            plan.graph.nodes()[1].payload.channels[0],
            ChannelSource::Pass(PassId(0))
        );
        assert_eq!(plan.presentation_index(), Some(1));
    }

    #[test]
    fn self_feedback_binds_own_output_without_edge() {
        let description = describe(&format!(
            "{}, {}",
            pass("Buffer A", 0, &buffer_input(0, 1)),
            pass("Image", 1, &buffer_input(0, 0))
        ));
        let plan = plan_graph(&description).unwrap();
        let buffer = &plan.graph.nodes()[0];
        assert_eq!(buffer.payload.channels[1], ChannelSource::Pass(PassId(0)));
        assert_eq!(buffer.payload.channels[0], ChannelSource::Unbound);
        assert_eq!(plan.graph.edges().collect::<Vec<_>>(), vec![(0, 1)]);
    }

    #[test]
    fn keyboard_input_fails_the_whole_build() {
        let description = describe(&format!(
            "{}, {}",
            pass("A", 0, ""),
            pass(
                "Image",
                1,
                r#"{ "id": 33, "channel": 2, "ctype": "keyboard" }"#
            )
        ));
        assert_eq!(
            plan_graph(&description).unwrap_err(),
            BuildError::UnsupportedInput {
                pass: "Image".into(),
                channel: 2,
                ctype: "keyboard".into()
            }
        );
    }

    #[test]
    fn common_pass_becomes_shared_source() {
        let description = describe(&format!(
            r#"{{ "name": "Common", "type": "common", "code": "float k() {{ return 1.0; }}", "outputs": [] }}, {}"#,
            pass("Image", 5, "")
        ));
        let plan = plan_graph(&description).unwrap();
        assert_eq!(plan.graph.len(), 1);
        assert!(plan.common.contains("float k()"));
    }

    #[test]
    fn image_named_pass_presents_even_when_not_last() {
        let description = describe(&format!(
            "{}, {}",
            pass("Image", 7, &buffer_input(8, 0)),
            pass("Buffer A", 8, "")
        ));
        let plan = plan_graph(&description).unwrap();
        assert_eq!(plan.presentation_index(), Some(0));
        assert_eq!(plan.graph.order(), &[1, 0]);
    }

    #[test]
    fn reading_the_presentation_output_binds_a_placeholder() {
        let description = describe(&format!(
            "{}, {}",
            pass("Buffer A", 0, &buffer_input(1, 0)),
            pass("Image", 1, "")
        ));
        let plan = plan_graph(&description).unwrap();
        assert_eq!(
            plan.graph.nodes()[0].payload.channels[0],
            ChannelSource::Placeholder
        );
    }

    #[test]
    fn texture_inputs_become_assets_and_kinds_follow_ctype() {
        let description = describe(&pass(
            "Image",
            0,
            r#"{ "id": 17, "channel": 0, "ctype": "texture", "src": "/media/a/noise.png" },
               { "id": 18, "channel": 1, "ctype": "cubemap", "src": "/media/a/cube.jpg" },
               { "id": 19, "channel": 3, "ctype": "volume" }"#,
        ));
        let plan = plan_graph(&description).unwrap();
        let spec = &plan.graph.nodes()[0].payload;
        assert_eq!(
            spec.channels[0],
            ChannelSource::Asset {
                src: "/media/a/noise.png".into()
            }
        );
        assert_eq!(spec.channels[1], ChannelSource::Placeholder);
        assert_eq!(spec.channels[2], ChannelSource::Unbound);
        assert_eq!(
            spec.kinds,
            [
                ChannelKind::Texture2d,
                ChannelKind::Cube,
                ChannelKind::Texture2d,
                ChannelKind::Volume
            ]
        );
        assert_eq!(plan.asset_sources().len(), 1);
    }

    #[test]
    fn mutual_inputs_are_a_cycle() {
        let description = describe(&format!(
            "{}, {}, {}",
            pass("A", 0, &buffer_input(1, 0)),
            pass("B", 1, &buffer_input(0, 0)),
            pass("Image", 2, &buffer_input(1, 0))
        ));
        assert!(matches!(
            plan_graph(&description),
            Err(BuildError::GraphCycleDetected { outputs }) if outputs == vec![0, 1, 2]
        ));
    }

    #[test]
    fn invalid_descriptions_are_rejected() {
        let missing_output = describe(r#"{ "name": "Image", "code": "", "outputs": [] }"#);
        assert!(matches!(
            plan_graph(&missing_output),
            Err(BuildError::InvalidArgument(_))
        ));

        let bad_channel = describe(&pass("Image", 0, &buffer_input(0, 4)));
        assert!(matches!(
            plan_graph(&bad_channel),
            Err(BuildError::InvalidArgument(message)) if message.contains("channel 4")
        ));

        let empty = describe("");
        assert!(matches!(
            plan_graph(&empty),
            Err(BuildError::InvalidArgument(_))
        ));
    }

    #[test]
    fn planning_is_deterministic() {
        let description = describe(&format!(
            "{}, {}, {}",
            pass("A", 0, &buffer_input(0, 0)),
            pass("B", 1, &format!("{}, {}", buffer_input(0, 0), buffer_input(1, 1))),
            pass("Image", 2, &format!("{}, {}", buffer_input(0, 0), buffer_input(1, 1)))
        ));
        let first = plan_graph(&description).unwrap();
        let second = plan_graph(&description).unwrap();
        assert_eq!(first.graph.output_ids(), second.graph.output_ids());
        assert_eq!(first.graph.edge_ids(), second.graph.edge_ids());
        assert_eq!(first.graph.order(), second.graph.order());
    }

    #[test]
    fn lowering_reports_the_failing_pass() {
        let description = describe(&format!(
            r#"{}, {{ "name": "Image", "type": "image", "code": "void mainImage(out vec4 c, in vec2 p) {{ c = missing(p); }}", "inputs": [ {} ], "outputs": [ {{ "id": 1 }} ] }}"#,
            pass("Buffer A", 0, ""),
            buffer_input(0, 0)
        ));
        let plan = plan_graph(&description).unwrap();
        match lower_plan(&plan, ShaderCompiler::Naga) {
            Err(BuildError::CompileFailed { pass, .. }) => assert_eq!(pass, "Image"),
            other => panic!("expected a compile failure, got {other:?}"),
        }
    }

    #[test]
    fn lowering_follows_execution_order() {
        let description = describe(&format!(
            r#"{{ "name": "Image", "type": "image", "code": "{MAIN}", "inputs": [ {} ], "outputs": [ {{ "id": 1 }} ] }}, {}"#,
            buffer_input(0, 0),
            pass("Buffer A", 0, "")
        ));
        let plan = plan_graph(&description).unwrap();
        let lowered = lower_plan(&plan, ShaderCompiler::Naga).unwrap();
        let names: Vec<_> = lowered.iter().map(|pass| pass.name.as_str()).collect();
        assert_eq!(names, ["Buffer A", "Image"]);
        assert!(lowered.iter().all(|pass| pass.words.first() == Some(&0x0723_0203)));
    }
}
