use crate::{NumericKind, Shape, TensorHandle};

/// Shape and element type an executable expects for one tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShapedType {
    pub shape: Shape,
    pub kind: NumericKind,
}

impl ShapedType {
    pub fn new(shape: impl Into<Shape>, kind: NumericKind) -> Self {
        Self {
            shape: shape.into(),
            kind,
        }
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.shape.byte_len(self.kind)
    }
}

/// A placeholder together with the contract it will be fed under.
#[derive(Clone, Debug)]
pub struct Feed {
    pub tensor: TensorHandle,
    pub shaped_type: ShapedType,
}

impl Feed {
    pub fn new(tensor: TensorHandle, shaped_type: ShapedType) -> Self {
        Self {
            tensor,
            shaped_type,
        }
    }

    /// Feeds a placeholder under exactly the shape and kind it was declared with.
    pub fn declared(tensor: &TensorHandle) -> Self {
        let shaped_type = ShapedType::new(tensor.shape().clone(), tensor.kind());
        Self::new(tensor.clone(), shaped_type)
    }
}
