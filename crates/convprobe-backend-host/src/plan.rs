use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use convprobe_core::{
    activation_dims, weight_dims, CompilationDescriptor, ConvolutionConfig, DataLayout, Error,
    Feed, Graph, NodeId, NumericKind, OptimizationLevel, Op, Result, Shape, ShapedType,
    TensorHandle, WeightsLayout,
};

use crate::kernels::{self, Conv2dParams};

pub(crate) const SUPPORTED_KINDS: &[NumericKind] = &[
    NumericKind::Int8,
    NumericKind::Int32,
    NumericKind::Float16,
    NumericKind::Float32,
];

#[derive(Debug)]
pub(crate) enum Step {
    Input {
        feed: usize,
    },
    Constant {
        raw: Bytes,
        decoded: Option<Arc<Vec<f32>>>,
    },
    Conv2d {
        input: usize,
        weights: usize,
        params: Conv2dParams,
    },
    Cast {
        input: usize,
    },
}

impl Step {
    pub(crate) fn operands(&self) -> Vec<usize> {
        match self {
            Step::Input { .. } | Step::Constant { .. } => Vec::new(),
            Step::Conv2d { input, weights, .. } => vec![*input, *weights],
            Step::Cast { input } => vec![*input],
        }
    }
}

#[derive(Debug)]
pub(crate) struct PlanNode {
    pub step: Step,
    pub kind: NumericKind,
    pub shape: Shape,
    /// Index of the last step reading this value; `usize::MAX` for outputs.
    pub last_use: usize,
}

/// Graph lowered to a linear list of steps in construction order.
#[derive(Debug)]
pub(crate) struct Plan {
    pub nodes: Vec<PlanNode>,
    pub outputs: Vec<usize>,
}

impl Plan {
    pub fn lower(
        graph: &Graph,
        feeds: &[Feed],
        targets: &[TensorHandle],
        descriptor: &CompilationDescriptor,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(Error::compilation("no target tensors requested"));
        }
        for tensor in feeds.iter().map(|f| &f.tensor).chain(targets) {
            if !graph.owns(tensor) {
                return Err(Error::compilation(format!(
                    "tensor {:?} was not created by this graph",
                    tensor.node()
                )));
            }
        }

        let fed = check_feeds(graph, feeds)?;
        let live = reachable(graph, targets);
        let aggressive = descriptor.optimization_level >= OptimizationLevel::Level1;

        let mut slots: Vec<Option<usize>> = vec![None; graph.nodes().len()];
        let mut nodes: Vec<PlanNode> = Vec::with_capacity(live.len());

        for id in live {
            let node = &graph.nodes()[id.0];
            if !SUPPORTED_KINDS.contains(&node.kind) {
                return Err(Error::compilation(format!(
                    "{} tensors are not supported by the host engine",
                    node.kind
                )));
            }
            let slot_of = |operand: NodeId| {
                slots[operand.0].ok_or_else(|| {
                    Error::compilation(format!("operand {operand:?} was not lowered"))
                })
            };

            let step = match &node.op {
                Op::Placeholder { name } => {
                    let feed = fed.iter().position(|f| *f == id).ok_or_else(|| {
                        Error::compilation(format!(
                            "target is not reachable from the declared inputs: placeholder `{name}` is not fed"
                        ))
                    })?;
                    Step::Input { feed }
                }
                Op::Constant { data } => {
                    let expected = node.shape.byte_len(node.kind);
                    if expected != Some(data.len()) {
                        return Err(Error::compilation(format!(
                            "constant {id:?} holds {} bytes, {:?} x {} needs {}",
                            data.len(),
                            node.shape.dims(),
                            node.kind,
                            expected.unwrap_or_default()
                        )));
                    }
                    let decoded = if aggressive {
                        Some(Arc::new(kernels::decode(data, node.kind)?))
                    } else {
                        None
                    };
                    Step::Constant {
                        raw: data.clone(),
                        decoded,
                    }
                }
                Op::Conv2d {
                    input,
                    weights,
                    config,
                } => {
                    let input_node = &graph.nodes()[input.0];
                    let weights_node = &graph.nodes()[weights.0];
                    if weights_node.kind != input_node.kind {
                        return Err(Error::compilation(format!(
                            "convolution mixes {} activations with {} weights",
                            input_node.kind, weights_node.kind
                        )));
                    }
                    let params = conv_params(&input_node.shape, &weights_node.shape, config)?;
                    Step::Conv2d {
                        input: slot_of(*input)?,
                        weights: slot_of(*weights)?,
                        params,
                    }
                }
                Op::Cast { input, .. } => {
                    let source = slot_of(*input)?;
                    if aggressive && nodes[source].kind == node.kind {
                        slots[id.0] = Some(source);
                        continue;
                    }
                    Step::Cast { input: source }
                }
            };

            slots[id.0] = Some(nodes.len());
            nodes.push(PlanNode {
                step,
                kind: node.kind,
                shape: node.shape.clone(),
                last_use: 0,
            });
        }

        let outputs = targets
            .iter()
            .map(|t| {
                slots[t.node().0]
                    .ok_or_else(|| Error::compilation(format!("target {:?} was not lowered", t.node())))
            })
            .collect::<Result<Vec<_>>>()?;

        for idx in 0..nodes.len() {
            for operand in nodes[idx].step.operands() {
                nodes[operand].last_use = idx;
            }
        }
        for &out in &outputs {
            nodes[out].last_use = usize::MAX;
        }

        Ok(Self { nodes, outputs })
    }

    pub fn output_types(&self) -> Vec<ShapedType> {
        self.outputs
            .iter()
            .map(|&idx| ShapedType::new(self.nodes[idx].shape.clone(), self.nodes[idx].kind))
            .collect()
    }
}

fn check_feeds(graph: &Graph, feeds: &[Feed]) -> Result<Vec<NodeId>> {
    let mut fed = Vec::with_capacity(feeds.len());
    for feed in feeds {
        let id = feed.tensor.node();
        let node = &graph.nodes()[id.0];
        if !matches!(node.op, Op::Placeholder { .. }) {
            return Err(Error::compilation(format!(
                "feed {id:?} is not a placeholder"
            )));
        }
        if fed.contains(&id) {
            return Err(Error::compilation(format!("placeholder {id:?} is fed twice")));
        }
        let declared = ShapedType::new(node.shape.clone(), node.kind);
        if feed.shaped_type != declared {
            return Err(Error::compilation(format!(
                "feed {id:?} declared as {declared:?} but compiled for {:?}",
                feed.shaped_type
            )));
        }
        fed.push(id);
    }
    Ok(fed)
}

/// Nodes the targets depend on, in construction order.
fn reachable(graph: &Graph, targets: &[TensorHandle]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<NodeId> = targets.iter().map(TensorHandle::node).collect();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(graph.nodes()[id.0].op.operands());
        }
    }
    let mut live: Vec<NodeId> = seen.into_iter().collect();
    live.sort_unstable();
    live
}

fn conv_params(input: &Shape, weights: &Shape, c: &ConvolutionConfig) -> Result<Conv2dParams> {
    if c.data_layout != DataLayout::Nchw || c.weights_layout != WeightsLayout::Oihw {
        return Err(Error::compilation(format!(
            "host engine only runs NCHW/OIHW convolutions, got {:?}/{:?}",
            c.data_layout, c.weights_layout
        )));
    }
    let malformed = || Error::compilation("convolution operands are not rank 4");
    let [batch, in_channels, height, width] =
        activation_dims(input, c.data_layout).ok_or_else(malformed)?;
    let [out_channels, _, kernel_h, kernel_w] =
        weight_dims(weights, c.weights_layout).ok_or_else(malformed)?;

    let extent = |len, k, stride, dilation| {
        c.padding
            .output_extent(len, k, stride, dilation)
            .ok_or_else(|| Error::compilation("input is smaller than the kernel"))
    };
    let out_h = extent(height, kernel_h, c.stride_y, c.dilation_y)?;
    let out_w = extent(width, kernel_w, c.stride_x, c.dilation_x)?;
    let padding = |len, k, stride, dilation| {
        c.padding
            .amounts(len, k, stride, dilation)
            .ok_or_else(|| Error::compilation("convolution padding is undefined"))
    };
    let (pad_top, _) = padding(height, kernel_h, c.stride_y, c.dilation_y)?;
    let (pad_left, _) = padding(width, kernel_w, c.stride_x, c.dilation_x)?;

    Ok(Conv2dParams {
        batch,
        in_channels,
        height,
        width,
        out_channels,
        kernel_h,
        kernel_w,
        out_h,
        out_w,
        stride_y: c.stride_y,
        stride_x: c.stride_x,
        dilation_y: c.dilation_y,
        dilation_x: c.dilation_x,
        pad_top,
        pad_left,
        groups: c.groups,
    })
}
