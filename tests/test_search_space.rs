//! Integration test: hyperparameter dimensions, spaces and the conditional optimizer

use kolosal_prep::optimizer::{
    build_float_grid, build_integer_grid, sgd_regression, svm, BayesianSettings, DimensionDefinition, DimensionSpace,
    HyperparamPoint, HyperparameterDimension, HyperparametersSpace, ParameterValue, Scaling, SearchSpace,
    SearchStrategyKind,
};

fn categorical(values: &[(&str, bool)]) -> HyperparameterDimension {
    HyperparameterDimension::categorical(DimensionDefinition::categorical(values)).unwrap()
}

fn point(pairs: &[(&str, ParameterValue)]) -> HyperparamPoint {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn svm_space() -> HyperparametersSpace {
    svm(
        vec![
            (
                "C".to_string(),
                HyperparameterDimension::float(DimensionDefinition::range(0.1, 100.0, Scaling::Logarithmic, 4)).unwrap(),
            ),
            ("kernel".to_string(), categorical(&[("linear", true), ("rbf", true), ("poly", true)])),
        ],
        categorical(&[("custom", true), ("scale", true), ("auto", true)]),
        HyperparameterDimension::float(DimensionDefinition::range(0.001, 10.0, Scaling::Logarithmic, 3)).unwrap(),
    )
}

#[test]
fn test_linear_float_grid() {
    let dim = HyperparameterDimension::float(DimensionDefinition::range(0.0, 1.0, Scaling::Linear, 5)).unwrap();
    let space = HyperparametersSpace::new(vec![("param".to_string(), dim)]);
    let grids = match space.build_space(SearchStrategyKind::Grid).unwrap() {
        SearchSpace::Grids(grids) => grids,
        other => panic!("expected grids, got {:?}", other),
    };
    assert_eq!(grids.len(), 1);
    let expected: Vec<ParameterValue> = [0.0, 0.25, 0.5, 0.75, 1.0].iter().map(|v| ParameterValue::Float(*v)).collect();
    assert_eq!(grids[0]["param"], expected);
}

#[test]
fn test_grid_scaling_boundaries() {
    for scaling in [Scaling::Linear, Scaling::Logarithmic] {
        let grid = build_float_grid(0.5, 20.0, 7, scaling).unwrap();
        assert_eq!(grid.len(), 7);
        assert_eq!(grid[0], 0.5);
        assert_eq!(grid[6], 20.0);
    }
    assert_eq!(build_float_grid(3.0, 9.0, 1, Scaling::Linear).unwrap(), vec![3.0]);
    assert_eq!(build_float_grid(3.0, 3.0, 4, Scaling::Linear).unwrap(), vec![3.0]);
}

#[test]
fn test_log_integer_grid_is_strictly_increasing() {
    let grid = build_integer_grid(1, 20, 15, Scaling::Logarithmic).unwrap();
    assert!(grid.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(grid.first(), Some(&1));
    assert_eq!(grid.last(), Some(&20));
    assert!(grid.len() < 15);
}

#[test]
fn test_random_strategy_renders_distributions() {
    let dim = HyperparameterDimension::integer(DimensionDefinition::range(1.0, 100.0, Scaling::Logarithmic, 5)).unwrap();
    match dim.build(SearchStrategyKind::Random).unwrap() {
        DimensionSpace::Distribution(_) => {}
        other => panic!("expected a distribution, got {:?}", other),
    }
    let mut space = HyperparametersSpace::new(vec![("n".to_string(), dim)]);
    space.set_random_state(7);
    for p in space.get_random_parameters(50).unwrap() {
        let n = p["n"].as_int().unwrap();
        assert!((1..=100).contains(&n));
    }
}

#[test]
fn test_svm_enrichment() {
    let space = svm_space();
    let linear = space.enrich(point(&[("kernel", "linear".into()), ("gamma", 0.3.into())]));
    assert!(!linear.contains_key("gamma"));

    let custom = space.enrich(point(&[
        ("kernel", "rbf".into()),
        ("gamma", "custom".into()),
        ("custom_gamma", 0.7.into()),
    ]));
    assert_eq!(custom["gamma"], ParameterValue::Float(0.7));
    assert!(!custom.contains_key("custom_gamma"));
}

#[test]
fn test_sgd_enrichment() {
    let space = sgd_regression(
        vec![("loss".to_string(), categorical(&[("huber", true), ("squared_loss", true)]))],
        HyperparameterDimension::float(DimensionDefinition::range(0.01, 1.0, Scaling::Linear, 3)).unwrap(),
    );
    let enriched = space.enrich(point(&[("loss", "squared_loss".into()), ("epsilon", 0.5.into())]));
    assert!(!enriched.contains_key("epsilon"));
    let kept = space.enrich(point(&[("loss", "huber".into()), ("epsilon", 0.5.into())]));
    assert_eq!(kept["epsilon"], ParameterValue::Float(0.5));
}

#[test]
fn test_gamma_optimizer_skips_linear_kernels() {
    let mut optimizer = svm_space().get_optimizer(BayesianSettings::default()).unwrap();
    let points: Vec<HyperparamPoint> = (0..10)
        .map(|i| {
            if i < 4 {
                point(&[("C", 1.0.into()), ("kernel", "linear".into())])
            } else {
                point(&[("C", 1.0.into()), ("kernel", "rbf".into()), ("gamma", "scale".into())])
            }
        })
        .collect();
    let scores: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
    optimizer.tell(&points, &scores).unwrap();

    assert_eq!(optimizer.primary_tell_count(), 10);
    assert_eq!(optimizer.conditional_tell_count("gamma"), Some(6));
    assert_eq!(optimizer.conditional_tell_count("custom_gamma"), Some(0));
}

#[test]
fn test_gamma_on_linear_kernels_is_not_routed() {
    let mut optimizer = svm_space().get_optimizer(BayesianSettings::default()).unwrap();
    let points: Vec<HyperparamPoint> = (0..10)
        .map(|i| {
            let kernel = if i < 4 { "linear" } else { "rbf" };
            point(&[("C", 1.0.into()), ("kernel", kernel.into()), ("gamma", "scale".into())])
        })
        .collect();
    let scores: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
    optimizer.tell(&points, &scores).unwrap();

    assert_eq!(optimizer.primary_tell_count(), 10);
    assert_eq!(optimizer.conditional_tell_count("gamma"), Some(6));
    assert_eq!(optimizer.conditional_tell_count("custom_gamma"), Some(0));
}

#[test]
fn test_asked_points_are_enriched() {
    let mut space = svm_space();
    space.set_random_state(11);
    let mut optimizer = space.get_optimizer(BayesianSettings::default().with_initial_points(3)).unwrap();
    for round in 0..3 {
        let points = optimizer.ask(4).unwrap();
        assert_eq!(points.len(), 4);
        for p in &points {
            assert!(!p.contains_key("custom_gamma"));
            if p["kernel"] == ParameterValue::from("linear") {
                assert!(!p.contains_key("gamma"));
            } else {
                assert!(p.contains_key("gamma"));
            }
        }
        let scores: Vec<f64> = points.iter().map(|p| p["C"].as_float().unwrap() + round as f64).collect();
        optimizer.tell(&points, &scores).unwrap();
    }
    assert_eq!(optimizer.primary_tell_count(), 12);
}
