//! Symbolic compute graphs.
//!
//! A [`Graph`] is append-only: every construction call pushes one node and returns a
//! fresh [`TensorHandle`]. Nodes are therefore stored in topological order, which the
//! engines rely on when they lower a graph into an execution plan.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use smallvec::{smallvec, SmallVec};

use crate::{DeviceBuffer, Error, NumericKind, Result, Shape};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Reference to one node of the graph that created it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorHandle {
    graph: GraphId,
    node: NodeId,
    kind: NumericKind,
    shape: Shape,
}

impl TensorHandle {
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn kind(&self) -> NumericKind {
        self.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaddingStyle {
    /// Output keeps `ceil(input / stride)`; padding is split with the extra element after.
    Same,
    Valid,
}

impl PaddingStyle {
    pub fn output_extent(
        self,
        input: usize,
        kernel: usize,
        stride: usize,
        dilation: usize,
    ) -> Option<usize> {
        let effective = dilated_extent(kernel, dilation)?;
        if stride == 0 {
            return None;
        }
        match self {
            PaddingStyle::Same => Some(input.div_ceil(stride)),
            PaddingStyle::Valid => input.checked_sub(effective).map(|rest| rest / stride + 1),
        }
    }

    /// Leading and trailing padding along one spatial axis.
    ///
    /// `None` for a zero kernel or stride, or an empty input.
    pub fn amounts(
        self,
        input: usize,
        kernel: usize,
        stride: usize,
        dilation: usize,
    ) -> Option<(usize, usize)> {
        let effective = dilated_extent(kernel, dilation)?;
        if stride == 0 || input == 0 {
            return None;
        }
        match self {
            PaddingStyle::Valid => Some((0, 0)),
            PaddingStyle::Same => {
                let out = input.div_ceil(stride);
                let total = ((out - 1) * stride)
                    .checked_add(effective)?
                    .saturating_sub(input);
                Some((total / 2, total - total / 2))
            }
        }
    }
}

fn dilated_extent(kernel: usize, dilation: usize) -> Option<usize> {
    kernel
        .checked_sub(1)?
        .checked_mul(dilation)?
        .checked_add(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataLayout {
    Nchw,
    Nhwc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WeightsLayout {
    Oihw,
    Hwio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConvolutionConfig {
    pub stride_x: usize,
    pub stride_y: usize,
    pub dilation_x: usize,
    pub dilation_y: usize,
    pub groups: usize,
    pub padding: PaddingStyle,
    pub data_layout: DataLayout,
    pub weights_layout: WeightsLayout,
}

impl Default for ConvolutionConfig {
    fn default() -> Self {
        Self {
            stride_x: 1,
            stride_y: 1,
            dilation_x: 1,
            dilation_y: 1,
            groups: 1,
            padding: PaddingStyle::Same,
            data_layout: DataLayout::Nchw,
            weights_layout: WeightsLayout::Oihw,
        }
    }
}

/// Input extents in `(batch, channels, height, width)` order, whatever the layout.
pub fn activation_dims(shape: &Shape, layout: DataLayout) -> Option<[usize; 4]> {
    let d: [usize; 4] = shape.dims().try_into().ok()?;
    Some(match layout {
        DataLayout::Nchw => d,
        DataLayout::Nhwc => [d[0], d[3], d[1], d[2]],
    })
}

/// Weight extents in `(out, in, height, width)` order, whatever the layout.
pub fn weight_dims(shape: &Shape, layout: WeightsLayout) -> Option<[usize; 4]> {
    let d: [usize; 4] = shape.dims().try_into().ok()?;
    Some(match layout {
        WeightsLayout::Oihw => d,
        WeightsLayout::Hwio => [d[3], d[2], d[0], d[1]],
    })
}

#[derive(Clone, Debug)]
pub enum Op {
    Placeholder {
        name: String,
    },
    Constant {
        data: Bytes,
    },
    Conv2d {
        input: NodeId,
        weights: NodeId,
        config: ConvolutionConfig,
    },
    Cast {
        input: NodeId,
        to: NumericKind,
    },
}

impl Op {
    pub fn operands(&self) -> SmallVec<[NodeId; 2]> {
        match self {
            Op::Placeholder { .. } | Op::Constant { .. } => SmallVec::new(),
            Op::Conv2d { input, weights, .. } => smallvec![*input, *weights],
            Op::Cast { input, .. } => smallvec![*input],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub op: Op,
    pub kind: NumericKind,
    pub shape: Shape,
}

#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    nodes: Vec<Node>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            id: GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)),
            nodes: Vec::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn owns(&self, tensor: &TensorHandle) -> bool {
        tensor.graph == self.id && tensor.node.0 < self.nodes.len()
    }

    /// Registers a graph input.
    pub fn declare_input(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        kind: NumericKind,
    ) -> Result<TensorHandle> {
        let shape = shape.into();
        shape.ensure_positive()?;
        Ok(self.push(
            Op::Placeholder {
                name: name.to_string(),
            },
            kind,
            shape,
        ))
    }

    /// Binds a zero-filled buffer of `byte_len` bytes as a constant.
    ///
    /// `byte_len` must equal `numel(shape) * byte_width(kind)`. The builder does not
    /// correct a mismatch; debug builds treat it as a broken precondition.
    pub fn declare_constant(
        &mut self,
        byte_len: usize,
        shape: impl Into<Shape>,
        kind: NumericKind,
    ) -> Result<TensorHandle> {
        let shape = shape.into();
        shape.ensure_positive()?;
        debug_assert_eq!(
            Some(byte_len),
            shape.byte_len(kind),
            "constant byte length does not match {:?} x {kind}",
            shape.dims()
        );
        let buffer = DeviceBuffer::zeroed(byte_len)?;
        Ok(self.push(
            Op::Constant {
                data: buffer.bytes().clone(),
            },
            kind,
            shape,
        ))
    }

    /// Binds caller-provided little-endian element data as a constant.
    ///
    /// The length is not checked here; compiling a graph whose constant does not hold
    /// exactly one dense tensor of its shape fails.
    pub fn declare_constant_data(
        &mut self,
        data: Bytes,
        shape: impl Into<Shape>,
        kind: NumericKind,
    ) -> Result<TensorHandle> {
        let shape = shape.into();
        shape.ensure_positive()?;
        Ok(self.push(Op::Constant { data }, kind, shape))
    }

    /// Appends a 2-D convolution. The result keeps the element type of `input`.
    pub fn convolve2d(
        &mut self,
        input: &TensorHandle,
        weights: &TensorHandle,
        config: ConvolutionConfig,
    ) -> Result<TensorHandle> {
        self.ensure_owned(input)?;
        self.ensure_owned(weights)?;
        let shape = conv2d_output_shape(&input.shape, &weights.shape, &config)?;
        Ok(self.push(
            Op::Conv2d {
                input: input.node,
                weights: weights.node,
                config,
            },
            input.kind,
            shape,
        ))
    }

    /// Appends an explicit conversion; the result is always of kind `to`.
    pub fn cast(&mut self, input: &TensorHandle, to: NumericKind) -> Result<TensorHandle> {
        self.ensure_owned(input)?;
        Ok(self.push(
            Op::Cast {
                input: input.node,
                to,
            },
            to,
            input.shape.clone(),
        ))
    }

    fn ensure_owned(&self, tensor: &TensorHandle) -> Result<()> {
        if self.owns(tensor) {
            Ok(())
        } else {
            Err(Error::ForeignTensor {
                node: tensor.node.0,
            })
        }
    }

    fn push(&mut self, op: Op, kind: NumericKind, shape: Shape) -> TensorHandle {
        let node = NodeId(self.nodes.len());
        self.nodes.push(Node {
            op,
            kind,
            shape: shape.clone(),
        });
        TensorHandle {
            graph: self.id,
            node,
            kind,
            shape,
        }
    }
}

fn conv2d_output_shape(input: &Shape, weights: &Shape, c: &ConvolutionConfig) -> Result<Shape> {
    let [n, ci, h, w] = activation_dims(input, c.data_layout)
        .ok_or_else(|| Error::invalid_shape(input.dims(), "convolution input must be rank 4"))?;
    let [co, wi, kh, kw] = weight_dims(weights, c.weights_layout)
        .ok_or_else(|| Error::invalid_shape(weights.dims(), "convolution weights must be rank 4"))?;

    let params = [c.stride_x, c.stride_y, c.dilation_x, c.dilation_y, c.groups];
    if params.contains(&0) {
        return Err(Error::invalid_shape(
            input.dims(),
            format!("strides, dilations and groups must be positive, got {c:?}"),
        ));
    }
    if ci != wi * c.groups || co % c.groups != 0 {
        return Err(Error::invalid_shape(
            weights.dims(),
            format!(
                "weights do not match {ci} input channels in {} groups",
                c.groups
            ),
        ));
    }

    let too_small = || Error::invalid_shape(input.dims(), "input is smaller than the kernel");
    let oh = c
        .padding
        .output_extent(h, kh, c.stride_y, c.dilation_y)
        .ok_or_else(too_small)?;
    let ow = c
        .padding
        .output_extent(w, kw, c.stride_x, c.dilation_x)
        .ok_or_else(too_small)?;

    Ok(match c.data_layout {
        DataLayout::Nchw => Shape::from_slice(&[n, co, oh, ow]),
        DataLayout::Nhwc => Shape::from_slice(&[n, oh, ow, co]),
    })
}
