use briny_graph::backend::{Capabilities, DeviceContext};
use briny_graph::graph::{ExecConfig, Executor, MaskPolicy, gradients};
use briny_graph::mask::{generate_mask, generation_seed};
use briny_graph::operators::OpKind;
use briny_graph::tensors::{Tensor, TensorFloat};
use briny_graph::value::Value;
use briny_graph::{DropoutConfig, OpError, dropout, ones_like, placeholder, sum};
use rayon::prelude::*;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn host(v: Vec<TensorFloat>) -> Value {
    Value::Host(Tensor::new(vec![v.len()], v))
}

fn data(v: &Value) -> Vec<TensorFloat> {
    v.as_host().unwrap().data.clone()
}

fn masked(mask: &Tensor<bool>, x: &[TensorFloat], scale: TensorFloat) -> Vec<TensorFloat> {
    mask.data
        .iter()
        .zip(x)
        .map(|(&k, &v)| if k { v * scale } else { 0.0 })
        .collect()
}

#[test]
fn test_training_run_forward_and_backward() {
    init_tracing();
    let x = placeholder(vec![4], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.5).with_seed(42), DeviceContext::Cpu).unwrap();
    let dx = gradients(&y, &[x.clone()]).unwrap()[0].clone().unwrap();
    assert_eq!(dx.op_name(), "DropoutGradient");

    let exec = Executor::new(vec![y, dx], ExecConfig::new(Capabilities::detect()));
    let out = exec.run(&[(x.id(), host(vec![1.0, 2.0, 3.0, 4.0]))], false).unwrap();

    let m = generate_mask(&[4], 0.5, 42);
    assert_eq!(data(&out[0]), masked(&m, &[1.0, 2.0, 3.0, 4.0], 2.0));
    assert_eq!(data(&out[1]), masked(&m, &[1.0; 4], 2.0));
}

#[test]
fn test_fetching_gradient_alone_runs_forward_first() {
    let x = placeholder(vec![16], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.5).with_seed(6), DeviceContext::Cpu).unwrap();
    let dx = gradients(&y, &[x.clone()]).unwrap()[0].clone().unwrap();

    let exec = Executor::new(vec![dx.clone()], ExecConfig::default());
    let pos = |id| exec.order().iter().position(|n| n.id() == id).unwrap();
    assert!(pos(y.id()) < pos(dx.id()));

    let out = exec.run(&[(x.id(), host(vec![0.0; 16]))], false).unwrap();
    assert_eq!(data(&out[0]), masked(&generate_mask(&[16], 0.5, 6), &[1.0; 16], 2.0));
}

#[test]
fn test_fan_out_gradients_are_summed() {
    let x = placeholder(vec![64], DeviceContext::Cpu);
    let a = dropout(&x, DropoutConfig::new(0.5).with_seed(1), DeviceContext::Cpu).unwrap();
    let b = dropout(&x, DropoutConfig::new(0.5).with_seed(2), DeviceContext::Cpu).unwrap();
    let z = sum(&[a.clone(), b.clone()], DeviceContext::Cpu).unwrap();

    let dx = gradients(&z, &[x.clone()]).unwrap()[0].clone().unwrap();
    let OpKind::Sum(_) = dx.op() else {
        panic!("fan-out gradient should be a Sum, got {}", dx.op_name());
    };
    assert_eq!(dx.inputs().len(), 2);

    let exec = Executor::new(vec![dx], ExecConfig::default());
    let out = exec.run(&[(x.id(), host(vec![1.0; 64]))], false).unwrap();

    let ma = generate_mask(&[64], 0.5, 1);
    let mb = generate_mask(&[64], 0.5, 2);
    let expected: Vec<TensorFloat> = masked(&ma, &[1.0; 64], 2.0)
        .iter()
        .zip(masked(&mb, &[1.0; 64], 2.0))
        .map(|(p, q)| p + q)
        .collect();
    assert_eq!(data(&out[0]), expected);
}

#[test]
fn test_repeated_consumer_accumulates() {
    let x = placeholder(vec![8], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.5).with_seed(3), DeviceContext::Cpu).unwrap();
    let z = sum(&[y.clone(), y.clone()], DeviceContext::Cpu).unwrap();
    let dx = gradients(&z, &[x.clone()]).unwrap()[0].clone().unwrap();

    let exec = Executor::new(vec![dx], ExecConfig::default());
    let out = exec.run(&[(x.id(), host(vec![1.0; 8]))], false).unwrap();
    assert_eq!(data(&out[0]), masked(&generate_mask(&[8], 0.5, 3), &[2.0; 8], 2.0));
}

#[test]
fn test_persistent_policy_keeps_mask_across_runs() {
    let x = placeholder(vec![32], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.5).with_seed(10), DeviceContext::Cpu).unwrap();
    let exec = Executor::new(vec![y.clone()], ExecConfig::default());
    let feed = [(x.id(), host(vec![1.0; 32]))];

    let first = exec.run(&feed, false).unwrap();
    let second = exec.run(&feed, false).unwrap();
    assert_eq!(first, second);
    assert_eq!(y.as_dropout().unwrap().generation(), 0);
}

#[test]
fn test_refresh_policy_advances_generation_each_run() {
    let x = placeholder(vec![32], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.5).with_seed(10), DeviceContext::Cpu).unwrap();
    let config = ExecConfig::new(Capabilities::none()).with_mask_policy(MaskPolicy::RefreshEachRun);
    let exec = Executor::new(vec![y.clone()], config);
    let feed = [(x.id(), host(vec![1.0; 32]))];

    let first = exec.run(&feed, false).unwrap();
    assert_eq!(y.as_dropout().unwrap().generation(), 0);
    assert_eq!(data(&first[0]), masked(&generate_mask(&[32], 0.5, 10), &[1.0; 32], 2.0));

    let second = exec.run(&feed, false).unwrap();
    assert_eq!(y.as_dropout().unwrap().generation(), 1);
    let m1 = generate_mask(&[32], 0.5, generation_seed(10, 1));
    assert_eq!(data(&second[0]), masked(&m1, &[1.0; 32], 2.0));

    // inference runs leave the pattern alone
    exec.run(&feed, true).unwrap();
    assert_eq!(y.as_dropout().unwrap().generation(), 1);
}

#[test]
fn test_inference_run_is_identity() {
    let x = placeholder(vec![5], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.2).with_seed(4), DeviceContext::Cpu).unwrap();
    let exec = Executor::new(vec![y.clone()], ExecConfig::default());
    let input = host(vec![1.0, -1.0, 2.5, 0.0, 9.0]);
    let out = exec.run(&[(x.id(), input.clone())], true).unwrap();
    assert_eq!(out[0], input);
    assert!(y.as_dropout().unwrap().pattern().is_none());
}

#[test]
fn test_ones_like_cannot_be_differentiated() {
    let x = placeholder(vec![2], DeviceContext::Cpu);
    let o = ones_like(&x, DeviceContext::Cpu).unwrap();
    assert!(matches!(
        gradients(&o, &[x]),
        Err(OpError::UnsupportedOperation { op: "OnesLike" })
    ));
}

#[test]
fn test_gradient_graph_cannot_be_differentiated_again() {
    let x = placeholder(vec![2], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.5), DeviceContext::Cpu).unwrap();
    let dx = gradients(&y, &[x.clone()]).unwrap()[0].clone().unwrap();
    assert!(matches!(
        gradients(&dx, &[x]),
        Err(OpError::UnsupportedOperation { .. })
    ));
}

#[test]
fn test_replicas_run_concurrently_with_private_state() {
    let results: Vec<(u64, Vec<TensorFloat>)> = (0..16u64)
        .into_par_iter()
        .map(|seed| {
            let x = placeholder(vec![256], DeviceContext::Cpu);
            let y = dropout(&x, DropoutConfig::new(0.5).with_seed(seed), DeviceContext::Cpu).unwrap();
            let dx = gradients(&y, &[x.clone()]).unwrap()[0].clone().unwrap();
            let exec = Executor::new(vec![dx], ExecConfig::default());
            let out = exec.run(&[(x.id(), host(vec![1.0; 256]))], false).unwrap();
            (seed, data(&out[0]))
        })
        .collect();

    for (seed, grad) in results {
        assert_eq!(grad, masked(&generate_mask(&[256], 0.5, seed), &[1.0; 256], 2.0));
    }
}

#[test]
fn test_nodes_move_across_threads() {
    let x = placeholder(vec![4], DeviceContext::Cpu);
    let y = dropout(&x, DropoutConfig::new(0.5).with_seed(8), DeviceContext::Cpu).unwrap();
    let handle = {
        let y = Arc::clone(&y);
        let x = Arc::clone(&x);
        std::thread::spawn(move || {
            let exec = Executor::new(vec![y], ExecConfig::default());
            exec.run(&[(x.id(), host(vec![1.0; 4]))], false).unwrap()
        })
    };
    let out = handle.join().unwrap();
    assert!(Arc::ptr_eq(
        &y.as_dropout().unwrap().mask().unwrap(),
        &y.as_dropout().unwrap().mask().unwrap()
    ));
    assert_eq!(data(&out[0]), masked(&generate_mask(&[4], 0.5, 8), &[1.0; 4], 2.0));
}
