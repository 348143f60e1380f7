//! Integration test: preprocessing handler and pipeline end-to-end

use kolosal_prep::frame::InputFrame;
use kolosal_prep::preprocessing::params::{
    CategoryHandling, DummyDrop, FeatureRole, FeatureType, ImputeWith, MissingHandling, NumericalHandling, Rescaling,
};
use kolosal_prep::preprocessing::{
    CollectorMode, CoreParams, CustomCodeRegistry, PerFeatureParams, PipelineOptions, PredictionType,
    PreprocessingDataCollector, PreprocessingHandler, PreprocessingParams, PreprocessingPipeline,
};
use kolosal_prep::preprocessing::output::SpecialOutput;
use polars::prelude::*;

fn sample_df(n: usize) -> DataFrame {
    let x: Vec<Option<f64>> = (0..n).map(|i| if i % 7 == 3 { None } else { Some(i as f64) }).collect();
    let c: Vec<&str> = (0..n).map(|i| ["red", "green", "blue"][i % 3]).collect();
    let y: Vec<f64> = (0..n).map(|i| (i as f64) * 0.5 + 1.0).collect();
    df!("x" => x, "c" => c, "y" => y).unwrap()
}

fn params(missing: MissingHandling, dummy_drop: DummyDrop) -> PreprocessingParams {
    let impute = (missing == MissingHandling::Impute).then_some(ImputeWith::Mean);
    let mut category = PerFeatureParams::new(FeatureRole::Input, FeatureType::Category)
        .with_missing(MissingHandling::None, None)
        .with_category_handling(CategoryHandling::Dummify);
    category.dummy_drop = dummy_drop;
    PreprocessingParams::default()
        .with_feature(
            "x",
            PerFeatureParams::new(FeatureRole::Input, FeatureType::Numeric)
                .with_missing(missing, impute)
                .with_numerical_handling(NumericalHandling::Regular)
                .with_rescaling(Rescaling::Avgstd),
        )
        .with_feature("c", category)
        .with_feature("y", PerFeatureParams::new(FeatureRole::Target, FeatureType::Numeric))
}

fn pipeline(df: &DataFrame, params: PreprocessingParams) -> PreprocessingPipeline {
    let frame = InputFrame::from_dataframe(df).unwrap();
    let collector = PreprocessingDataCollector::new(&frame, &params, CollectorMode::Prediction)
        .build()
        .unwrap();
    let handler = PreprocessingHandler::build(
        CoreParams::new(PredictionType::Regression).with_target("y"),
        params,
        collector,
        None,
        CustomCodeRegistry::new(),
    )
    .unwrap();
    handler.build_pipeline(PipelineOptions::training()).unwrap()
}

#[test]
fn test_impute_and_dummify_shape() {
    let df = sample_df(100);
    let mut p = pipeline(&df, params(MissingHandling::Impute, DummyDrop::None));
    let result = p.fit_and_process(&df).unwrap();
    let train = result.train().unwrap();
    assert_eq!(train.shape(), (100, 4), "1 numeric + 3 dummies, no row dropped");
    let dense = train.as_dense_array().unwrap();
    assert!(dense.iter().all(|v| !v.is_nan()), "imputation leaves no NaN");
}

#[test]
fn test_dummy_drop_removes_one_level() {
    let df = sample_df(100);
    let mut p = pipeline(&df, params(MissingHandling::Impute, DummyDrop::Drop));
    let result = p.fit_and_process(&df).unwrap();
    assert_eq!(result.train().unwrap().shape(), (100, 3));
}

#[test]
fn test_replay_is_deterministic() {
    let df = sample_df(60);
    let mut p = pipeline(&df, params(MissingHandling::Impute, DummyDrop::None));
    p.fit_and_process(&df).unwrap();

    let first = p.process(&df, None).unwrap();
    let second = p.process(&df, None).unwrap();
    let a = first.train().unwrap();
    let b = second.train().unwrap();
    assert_eq!(a.columns(), b.columns());
    assert_eq!(a.index(), b.index());
    assert_eq!(a.as_dense_array().unwrap(), b.as_dense_array().unwrap());
}

#[test]
fn test_process_uses_fitted_resources_only() {
    let train = sample_df(60);
    let mut p = pipeline(&train, params(MissingHandling::Impute, DummyDrop::None));
    p.fit_and_process(&train).unwrap();
    let before = p.process(&train, None).unwrap();

    // A very different frame in between must not move the fitted statistics.
    let other = df!(
        "x" => &[Some(1000.0), Some(-1000.0), None],
        "c" => &["purple", "red", "green"],
        "y" => &[1.0, 2.0, 3.0],
    )
    .unwrap();
    let shifted = p.process(&other, None).unwrap();
    assert_eq!(shifted.train().unwrap().shape().0, 3);

    let after = p.process(&train, None).unwrap();
    assert_eq!(
        before.train().unwrap().as_dense_array().unwrap(),
        after.train().unwrap().as_dense_array().unwrap()
    );
}

#[test]
fn test_drop_rows_is_monotonic() {
    let df = sample_df(70);
    let mut p = pipeline(&df, params(MissingHandling::DropRow, DummyDrop::None));
    let result = p.fit_and_process(&df).unwrap();
    let train = result.train().unwrap();
    assert_eq!(train.height(), 60, "every seventh row has no x");
    assert!(train.height() <= df.height());

    let target = result.side(SpecialOutput::Target).unwrap();
    assert_eq!(target.index, train.index());
    assert!(target.missing_mask().iter().all(|m| !m));
}
