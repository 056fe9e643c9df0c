//! Inception blocks: channel concatenation forward, split-and-sum backward.

use super::*;
use crate::engine::PropagationEngine;
use crate::network::{Branch, LayerDescriptor, Network};
use derest_core::DerestError;
use ndarray::{Array1, Array4};

fn conv(c_out: usize, c_in: usize, f: usize, padding: usize, seed: u64) -> Convolutional {
    let w: Array4<f32> = random_array(&[c_out, c_in, f, f], seed)
        .into_dimensionality()
        .unwrap();
    Convolutional::new(w, Array1::from_vec(pseudo_random(c_out, seed + 7)), 1, padding, 1).unwrap()
}

fn branches() -> Vec<Branch> {
    vec![
        Branch::new(
            "a",
            vec![
                LayerDescriptor::convolutional("conv", conv(3, 2, 1, 0, 51)),
                LayerDescriptor::relu("relu"),
            ],
        ),
        Branch::new(
            "b",
            vec![LayerDescriptor::convolutional("conv", conv(2, 2, 3, 1, 52))],
        ),
        Branch::new("id", vec![]),
        Branch::new(
            "pool",
            vec![LayerDescriptor::pooling(
                "max",
                Pooling::max(3).with_stride(1).with_padding(1),
            )],
        ),
    ]
}

fn inception_net() -> Network {
    let fc_w = random_array(&[9 * 16, 3], 53).into_dimensionality().unwrap();
    Network::new(
        "mixed-net",
        vec![2, 4, 4],
        vec![
            LayerDescriptor::inception("mixed", branches()),
            LayerDescriptor::fully_connected("fc", FullyConnected::without_bias(fc_w)),
        ],
    )
}

#[test]
fn test_inception_paths_and_shapes() {
    let net = inception_net();
    let engine = PropagationEngine::new(&net).unwrap();
    assert_eq!(engine.node_count(), net.node_count());
    let mixed = engine.node(engine.find("mixed").unwrap()).unwrap();
    assert_eq!(mixed.kind, "inception");
    assert_eq!(mixed.output_shape, vec![9, 4, 4]);

    let nested = engine.node(engine.find("mixed/b/conv").unwrap()).unwrap();
    assert_eq!(nested.depth, 1);
    assert_eq!(nested.output_shape, vec![2, 4, 4]);

    let weighted: Vec<_> = engine
        .weighted_layers()
        .iter()
        .map(|&id| engine.node(id).unwrap().path.clone())
        .collect();
    let declared: Vec<_> = net.weighted_layers().into_iter().map(|l| l.path).collect();
    assert_eq!(weighted, declared);
    assert_eq!(weighted, vec!["mixed/a/conv", "mixed/b/conv", "fc"]);
}

#[test]
fn test_inception_forward_is_branch_concatenation() {
    let net = inception_net();
    let engine = PropagationEngine::new(&net).unwrap();
    let input = random_box(&[2, 4, 4], 54, 1.0, 0.4);
    let state = engine.propagate(&input, &engine.identity_seed().unwrap()).unwrap();
    let fc = engine.find("fc").unwrap();
    let concatenated = state.activation(fc).unwrap();
    assert_eq!(concatenated.shape(), &[9, 4, 4]);

    // identity branch occupies channels 5..7
    let identity = concatenated.slice_axis(0, 5, 7).unwrap();
    assert_eq!(identity, input);

    let b_conv = engine.find("mixed/b/conv").unwrap();
    assert_eq!(state.activation(b_conv).unwrap(), &input);
}

#[test]
fn test_split_backward_equals_composite_backward() {
    let net = inception_net();
    let engine = PropagationEngine::new(&net).unwrap();
    let input = random_box(&[2, 4, 4], 55, 1.0, 0.4);
    let state = engine.propagate(&input, &engine.identity_seed().unwrap()).unwrap();
    let mixed = engine.find("mixed").unwrap();
    let composite_derivative = state.derivative(mixed).unwrap();
    assert_eq!(composite_derivative.shape(), &[3, 9, 4, 4]);

    let mut offset = 0;
    let mut total: Option<Interval> = None;
    for branch in branches() {
        let standalone = Network::new(branch.name.clone(), vec![2, 4, 4], branch.layers);
        let upstream = if standalone.layers.is_empty() {
            let slice = composite_derivative.slice_axis(1, offset, offset + 2).unwrap();
            offset += 2;
            slice
        } else {
            let engine = PropagationEngine::new(&standalone).unwrap();
            let width = engine.output_shape()[0];
            let slice = composite_derivative
                .slice_axis(1, offset, offset + width)
                .unwrap();
            offset += width;
            engine
                .propagate(&input, &slice)
                .unwrap()
                .input_derivative()
                .unwrap()
                .clone()
        };
        total = Some(match total {
            None => upstream,
            Some(acc) => acc.add(&upstream).unwrap(),
        });
    }
    assert_eq!(offset, 9);
    assert_intervals_close(
        &total.unwrap(),
        state.input_derivative().unwrap(),
        "split backward",
    );
}

#[test]
fn test_point_inside_box_through_inception() {
    let net = inception_net();
    let engine = PropagationEngine::new(&net).unwrap();
    let input = random_box(&[2, 4, 4], 56, 1.0, 0.4);
    let seed = engine.identity_seed().unwrap();
    let boxed = engine.propagate(&input, &seed).unwrap();
    for s in 0..5 {
        let exact = engine
            .propagate(&Interval::concrete(sample_inside(&input, 1200 + s)), &seed)
            .unwrap();
        assert_encloses(boxed.output().unwrap(), &exact.output().unwrap().lower, "output");
        assert_encloses(
            boxed.input_derivative().unwrap(),
            &exact.input_derivative().unwrap().lower,
            "input derivative",
        );
    }
}

#[test]
fn test_inception_validation() {
    let empty = Network::new(
        "empty",
        vec![2, 4, 4],
        vec![LayerDescriptor::inception("mixed", vec![])],
    );
    let err = PropagationEngine::new(&empty).unwrap_err();
    assert!(matches!(err.root_cause(), DerestError::InvalidConfig(_)));

    let shrinking = Network::new(
        "shrinking",
        vec![2, 4, 4],
        vec![LayerDescriptor::inception(
            "mixed",
            vec![
                Branch::new("id", vec![]),
                Branch::new(
                    "valid",
                    vec![LayerDescriptor::convolutional("conv", conv(1, 2, 3, 0, 57))],
                ),
            ],
        )],
    );
    let err = PropagationEngine::new(&shrinking).unwrap_err();
    assert!(matches!(err.root_cause(), DerestError::ShapeMismatch { .. }));

    let flat = Network::new(
        "flat",
        vec![8],
        vec![LayerDescriptor::inception("mixed", vec![Branch::new("id", vec![])])],
    );
    let err = PropagationEngine::new(&flat).unwrap_err();
    assert!(matches!(err.root_cause(), DerestError::InvalidConfig(_)));
}
