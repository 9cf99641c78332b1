use briny_graph::tensors::{Tensor, element_count};
use briny_graph::tensor;
use briny_graph::value::Value;

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0]);
    });
    assert!(result.is_err());
}

#[test]
fn test_tensor_macro() {
    let t: Tensor<f32> = tensor!([[1.0, 2.0], [3.0, 4.0]]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);

    let cube: Tensor<f32> = tensor!([[[1.0], [2.0]], [[3.0], [4.0]]]);
    assert_eq!(cube.shape, vec![2, 2, 1]);
}

#[test]
fn test_scalar_and_empty_shapes() {
    assert_eq!(element_count(&[]), 1);
    assert_eq!(element_count(&[3, 0, 2]), 0);

    let scalar = Tensor::full(Vec::new(), 2.5f32);
    assert_eq!(scalar.len(), 1);
    assert!(Tensor::zeros(vec![0]).is_empty());
}

#[test]
fn test_value_residency() {
    let v = Value::from(Tensor::ones(vec![3]));
    assert_eq!(v.shape(), &[3]);
    assert!(v.as_host().is_some());
    assert!(v.as_device().is_none());
    assert!(v.device("Dropout").is_err());
}
