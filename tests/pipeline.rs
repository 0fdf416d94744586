//! End-to-end pipeline tests against a real compute device.
//!
//! Every test is gated on device availability: when no adapter is present
//! (or `GPQ_DISABLE` is set) the test skips rather than fails, so the
//! suite is safe on headless CI.

use std::sync::LazyLock;

use proptest::prelude::*;

use gpq::{
    binding, elem, lit_f32, lit_i32, make_struct, Context, DeviceElement, ElementSchema, Error,
    FieldDef, Query, ScalarType, StructSchema,
};

static CTX: LazyLock<Option<Context>> = LazyLock::new(|| match Context::new() {
    Ok(ctx) => Some(ctx),
    Err(e) => {
        eprintln!("no compute device, skipping device tests: {e}");
        None
    }
});

fn ctx() -> Option<&'static Context> {
    CTX.as_ref()
}

fn assert_close(got: f32, want: f32) {
    let tol = 1e-3_f32 * want.abs().max(1.0);
    assert!(
        (got - want).abs() <= tol,
        "got {got}, want {want} (tolerance {tol})"
    );
}

// ── element-wise pipelines ──────────────────────────────────────────────

#[test]
fn select_applies_to_every_element() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3, 4, 5]).unwrap();
    let out: Vec<i32> = ctx.run(&xs.query().select(elem().mul(lit_i32(2)))).unwrap();
    assert_eq!(out, vec![2, 4, 6, 8, 10]);
}

#[test]
fn chained_selects_compose_in_order() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let out: Vec<i32> = ctx
        .run(
            &xs.query()
                .select(elem().add(lit_i32(10)))
                .select(elem().mul(elem())),
        )
        .unwrap();
    assert_eq!(out, vec![121, 144, 169]);
}

#[test]
fn cast_between_numeric_types() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let out: Vec<f32> = ctx
        .run(&xs.query().select(elem().cast_f32().div(lit_f32(2.0))))
        .unwrap();
    assert_eq!(out, vec![0.5, 1.0, 1.5]);

    let ys = ctx.create_array(&[1.9f32, -1.9, 3.2]).unwrap();
    let trunc: Vec<i32> = ctx.run(&ys.query().select(elem().cast_i32())).unwrap();
    assert_eq!(trunc, vec![1, -1, 3]);
}

#[test]
fn filter_preserves_relative_order() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[5i32, 2, 9, 4, 7, 6, 1, 8]).unwrap();
    let out: Vec<i32> = ctx
        .run(
            &xs.query()
                .filter(elem().rem(lit_i32(2)).eq(lit_i32(0)))
                .select(elem().mul(elem())),
        )
        .unwrap();
    assert_eq!(out, vec![4, 16, 36, 64]);
}

#[test]
fn consecutive_filters_conjoin() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<i32> = (0..100).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let out: Vec<i32> = ctx
        .run(
            &arr.query()
                .filter(elem().rem(lit_i32(2)).eq(lit_i32(0)))
                .filter(elem().gt(lit_i32(50))),
        )
        .unwrap();
    let want: Vec<i32> = (0..100).filter(|x| x % 2 == 0 && *x > 50).collect();
    assert_eq!(out, want);
}

#[test]
fn filter_rejecting_everything_yields_empty() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let out: Vec<i32> = ctx
        .run(&xs.query().filter(elem().gt(lit_i32(100))))
        .unwrap();
    assert!(out.is_empty());
}

#[test]
fn let_bindings_chain_and_evaluate_once_per_element() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let out: Vec<i32> = ctx
        .run(
            &xs.query()
                .let_binding("a", elem().mul(lit_i32(2)))
                .let_binding("b", binding("a").add(lit_i32(1)))
                .select(binding("a").mul(binding("b"))),
        )
        .unwrap();
    // a = 2x, b = 2x + 1
    assert_eq!(out, vec![2 * 3, 4 * 5, 6 * 7]);
}

#[test]
fn math_intrinsics_match_host_within_tolerance() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<f32> = (1..50).map(|i| i as f32 / 7.0).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let out: Vec<f32> = ctx
        .run(
            &arr.query()
                .select(elem().sqrt().add(elem().cos()).add(elem().pow(lit_f32(1.5)))),
        )
        .unwrap();
    for (got, x) in out.iter().zip(&xs) {
        assert_close(*got, x.sqrt() + x.cos() + x.powf(1.5));
    }
}

// ── zip ─────────────────────────────────────────────────────────────────

#[test]
fn zip_combines_pairwise() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let ys = ctx.create_array(&[10i32, 20, 30]).unwrap();
    let out: Vec<i32> = ctx
        .run(&Query::zip(&xs, &ys, gpq::zip_left().add(gpq::zip_right())).unwrap())
        .unwrap();
    assert_eq!(out, vec![11, 22, 33]);
}

#[test]
fn zip_pipeline_supports_downstream_operators() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3, 4]).unwrap();
    let ys = ctx.create_array(&[4i32, 3, 2, 1]).unwrap();
    let out: Vec<i32> = ctx
        .run(
            &Query::zip(&xs, &ys, gpq::zip_left().mul(gpq::zip_right()))
                .unwrap()
                .filter(elem().gt(lit_i32(4))),
        )
        .unwrap();
    assert_eq!(out, vec![6, 6]);
}

#[test]
fn zip_length_mismatch_fails_before_device_work() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let ys = ctx.create_array(&[1i32, 2]).unwrap();
    let err = Query::zip(&xs, &ys, gpq::zip_left().add(gpq::zip_right())).unwrap_err();
    assert!(matches!(
        err,
        Error::MismatchedLength { left: 3, right: 2 }
    ));
}

// ── reductions ──────────────────────────────────────────────────────────

#[test]
fn sum_matches_host() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<i32> = (-500..500).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let got: i32 = ctx.reduce(&arr.query().select(elem().mul(elem())).sum()).unwrap();
    let want: i32 = xs.iter().map(|x| x * x).sum();
    assert_eq!(got, want);
}

#[test]
fn sum_of_floats_within_tolerance() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<f32> = (0..10_000).map(|i| (i as f32).sin()).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let got: f32 = ctx.reduce(&arr.query().sum()).unwrap();
    let want: f32 = xs.iter().sum();
    assert_close(got, want);
}

#[test]
fn count_respects_filter() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<i32> = (0..1_000).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let got: i32 = ctx
        .reduce(&arr.query().filter(elem().rem(lit_i32(3)).eq(lit_i32(0))).count())
        .unwrap();
    assert_eq!(got, 334);
}

#[test]
fn zip_sum_computes_dot_product() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<i32> = (1..=200).collect();
    let ys: Vec<i32> = (1..=200).rev().collect();
    let a = ctx.create_array(&xs).unwrap();
    let b = ctx.create_array(&ys).unwrap();
    let q = Query::zip(&a, &b, gpq::zip_left().mul(gpq::zip_right())).unwrap();
    let got: i32 = ctx.reduce(&q.sum()).unwrap();
    let want: i32 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
    assert_eq!(got, want);
}

#[test]
fn sum_after_filter_only_includes_survivors() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<i32> = (1..=100).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let got: i32 = ctx
        .reduce(&arr.query().filter(elem().gt(lit_i32(90))).sum())
        .unwrap();
    assert_eq!(got, (91..=100).sum::<i32>());
}

#[test]
fn empty_input_short_circuits() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[] as &[i32]).unwrap();
    let out: Vec<i32> = ctx.run(&xs.query().select(elem().add(lit_i32(1)))).unwrap();
    assert!(out.is_empty());
    let sum: i32 = ctx.reduce(&xs.query().sum()).unwrap();
    assert_eq!(sum, 0);
    let count: i32 = ctx.reduce(&xs.query().count()).unwrap();
    assert_eq!(count, 0);
}

// ── structs ─────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct Node {
    x: i32,
    y: i32,
}

impl DeviceElement for Node {
    fn element_schema() -> ElementSchema {
        ElementSchema::Struct(StructSchema::new(
            "Node",
            vec![
                FieldDef::new("x", ScalarType::I32, 0),
                FieldDef::new("y", ScalarType::I32, 4),
            ],
            8,
        ))
    }
}

fn node_schema() -> StructSchema {
    match Node::element_schema() {
        ElementSchema::Struct(s) => s,
        ElementSchema::Scalar(_) => unreachable!(),
    }
}

#[test]
fn struct_elements_round_trip_through_a_pipeline() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let out: Vec<Node> = ctx
        .run(&xs.query().select(make_struct(
            node_schema(),
            vec![elem(), elem().mul(elem())],
        )))
        .unwrap();
    assert_eq!(
        out,
        vec![
            Node { x: 1, y: 1 },
            Node { x: 2, y: 4 },
            Node { x: 3, y: 9 }
        ]
    );
}

#[test]
fn struct_fields_project_and_filter() {
    let Some(ctx) = ctx() else { return };
    let nodes = ctx
        .create_array(&[
            Node { x: 1, y: 10 },
            Node { x: 2, y: 20 },
            Node { x: 3, y: 30 },
        ])
        .unwrap();
    let out: Vec<i32> = ctx
        .run(
            &nodes
                .query()
                .filter(elem().field("x").ne(lit_i32(2)))
                .select(elem().field("y")),
        )
        .unwrap();
    assert_eq!(out, vec![10, 30]);
}

// ── indexed reads ───────────────────────────────────────────────────────

#[test]
fn read_at_gathers_from_another_array() {
    let Some(ctx) = ctx() else { return };
    let table = ctx.create_array(&[100i32, 200, 300, 400]).unwrap();
    let idx = ctx.create_array(&[3i32, 0, 2, 1, 3]).unwrap();
    let out: Vec<i32> = ctx
        .run(&idx.query().select(table.read_at(elem())))
        .unwrap();
    assert_eq!(out, vec![400, 100, 300, 200, 400]);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct Complex {
    re: f32,
    im: f32,
}

impl DeviceElement for Complex {
    fn element_schema() -> ElementSchema {
        ElementSchema::Struct(StructSchema::new(
            "Complex",
            vec![
                FieldDef::new("re", ScalarType::F32, 0),
                FieldDef::new("im", ScalarType::F32, 4),
            ],
            8,
        ))
    }
}

fn complex_schema() -> StructSchema {
    match Complex::element_schema() {
        ElementSchema::Struct(s) => s,
        ElementSchema::Scalar(_) => unreachable!(),
    }
}

// One radix-2 decimation-in-time butterfly stage over 8 complex samples:
// struct-valued let bindings, struct reads from another device array, and
// trig chains inside bindings, all fused into one kernel.
#[test]
fn butterfly_stage_with_struct_bindings_matches_host() {
    let Some(ctx) = ctx() else { return };
    let n = 8usize;
    let half = (n / 2) as i32;
    let input: Vec<Complex> = (0..n)
        .map(|i| Complex {
            re: (i as f32 * 0.7).cos(),
            im: (i as f32 * 0.7).sin(),
        })
        .collect();
    let samples = ctx.create_array(&input).unwrap();
    let ks: Vec<i32> = (0..half).collect();
    let idx = ctx.create_array(&ks).unwrap();

    let angle_step = -std::f32::consts::PI / half as f32;
    let out: Vec<Complex> = ctx
        .run(
            &idx.query()
                .let_binding("a", samples.read_at(elem()))
                .let_binding("b", samples.read_at(elem().add(lit_i32(half))))
                .let_binding("wr", elem().cast_f32().mul(lit_f32(angle_step)).cos())
                .let_binding("wi", elem().cast_f32().mul(lit_f32(angle_step)).sin())
                .let_binding(
                    "tre",
                    binding("wr")
                        .mul(binding("b").field("re"))
                        .sub(binding("wi").mul(binding("b").field("im"))),
                )
                .let_binding(
                    "tim",
                    binding("wr")
                        .mul(binding("b").field("im"))
                        .add(binding("wi").mul(binding("b").field("re"))),
                )
                .select(make_struct(
                    complex_schema(),
                    vec![
                        binding("a").field("re").add(binding("tre")),
                        binding("a").field("im").add(binding("tim")),
                    ],
                )),
        )
        .unwrap();

    assert_eq!(out.len(), half as usize);
    for (k, got) in out.iter().enumerate() {
        let a = input[k];
        let b = input[k + half as usize];
        let angle = angle_step * k as f32;
        let (wr, wi) = (angle.cos(), angle.sin());
        assert_close(got.re, a.re + (wr * b.re - wi * b.im));
        assert_close(got.im, a.im + (wr * b.im + wi * b.re));
    }
}

#[test]
fn get_agrees_with_to_array() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<i32> = (0..37).map(|i| i * 13 - 5).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let all = arr.to_array().unwrap();
    assert_eq!(all, xs);
    for i in [0usize, 1, 18, 36] {
        assert_eq!(arr.get(i).unwrap(), xs[i]);
    }
    assert!(arr.get(37).is_err());
}

// ── fill ────────────────────────────────────────────────────────────────

#[test]
fn fill_writes_into_existing_array() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3, 4]).unwrap();
    let dest = ctx.create_array(&[0i32; 4]).unwrap();
    let written = ctx
        .fill(&xs.query().select(elem().mul(lit_i32(3))), &dest)
        .unwrap();
    assert_eq!(written, 4);
    assert_eq!(dest.to_array().unwrap(), vec![3, 6, 9, 12]);
}

#[test]
fn fill_after_filter_writes_a_prefix_and_returns_count() {
    let Some(ctx) = ctx() else { return };
    let xs: Vec<i32> = (0..20).collect();
    let arr = ctx.create_array(&xs).unwrap();
    let dest = ctx.create_array(&[-1i32; 20]).unwrap();
    let written = ctx
        .fill(&arr.query().filter(elem().rem(lit_i32(5)).eq(lit_i32(0))), &dest)
        .unwrap();
    assert_eq!(written, 4);
    let host = dest.to_array().unwrap();
    assert_eq!(&host[..4], &[0, 5, 10, 15]);
    assert_eq!(&host[4..], &[-1; 16]);
}

#[test]
fn fill_overflowing_destination_fails() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3, 4]).unwrap();
    let dest = ctx.create_array(&[0i32; 2]).unwrap();
    let err = ctx.fill(&xs.query(), &dest).unwrap_err();
    assert!(matches!(err, Error::MismatchedLength { left: 4, right: 2 }));
}

// ── disposal ────────────────────────────────────────────────────────────

#[test]
fn disposed_array_fails_on_readback_and_execution() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2, 3]).unwrap();
    let query = xs.query().select(elem().add(lit_i32(1)));
    xs.dispose();

    assert!(matches!(xs.to_array(), Err(Error::DisposedResource(_))));
    assert!(matches!(xs.get(0), Err(Error::DisposedResource(_))));
    assert!(matches!(
        ctx.run::<i32>(&query),
        Err(Error::DisposedResource(_))
    ));
}

#[test]
fn dispose_is_idempotent() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32]).unwrap();
    xs.dispose();
    xs.dispose();
    assert!(xs.to_array().is_err());
}

#[test]
fn disposed_indexed_buffer_fails_at_plan_time() {
    let Some(ctx) = ctx() else { return };
    let table = ctx.create_array(&[1i32, 2]).unwrap();
    let idx = ctx.create_array(&[0i32, 1]).unwrap();
    let query = idx.query().select(table.read_at(elem()));
    table.dispose();
    assert!(matches!(
        ctx.run::<i32>(&query),
        Err(Error::DisposedResource(_))
    ));
}

// ── type errors ─────────────────────────────────────────────────────────

#[test]
fn non_bool_predicate_is_rejected() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32]).unwrap();
    assert!(matches!(
        ctx.run::<i32>(&xs.query().filter(elem().add(lit_i32(1)))),
        Err(Error::Schema(_))
    ));
}

#[test]
fn mixed_type_arithmetic_is_rejected() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32]).unwrap();
    assert!(matches!(
        ctx.run::<i32>(&xs.query().select(elem().add(lit_f32(1.0)))),
        Err(Error::Schema(_))
    ));
}

#[test]
fn output_type_mismatch_is_rejected() {
    let Some(ctx) = ctx() else { return };
    let xs = ctx.create_array(&[1i32, 2]).unwrap();
    assert!(matches!(
        ctx.run::<f32>(&xs.query()),
        Err(Error::Schema(_))
    ));
}

// ── workgroup boundaries ────────────────────────────────────────────────

#[test]
fn compaction_is_exact_across_workgroup_boundaries() {
    let Some(ctx) = ctx() else { return };
    for n in [1usize, 255, 256, 257, 511, 513, 4096, 10_000] {
        let xs: Vec<i32> = (0..n as i32).collect();
        let arr = ctx.create_array(&xs).unwrap();
        let out: Vec<i32> = ctx
            .run(&arr.query().filter(elem().rem(lit_i32(7)).lt(lit_i32(3))))
            .unwrap();
        let want: Vec<i32> = xs.iter().copied().filter(|x| x % 7 < 3).collect();
        assert_eq!(out, want, "n = {n}");
    }
}

#[test]
fn reduction_is_exact_across_workgroup_boundaries() {
    let Some(ctx) = ctx() else { return };
    for n in [1usize, 256, 257, 65_536, 100_000] {
        let xs: Vec<i32> = (0..n as i32).map(|i| i % 101 - 50).collect();
        let arr = ctx.create_array(&xs).unwrap();
        let got: i32 = ctx.reduce(&arr.query().sum()).unwrap();
        assert_eq!(got, xs.iter().sum::<i32>(), "n = {n}");
    }
}

// ── property tests ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_map_matches_host(
        xs in proptest::collection::vec(-1_000i32..1_000, 0..500),
        a in -100i32..100,
        b in -100i32..100,
    ) {
        let Some(ctx) = ctx() else { return Ok(()) };
        let arr = ctx.create_array(&xs).unwrap();
        let out: Vec<i32> = ctx
            .run(&arr.query().select(elem().mul(lit_i32(a)).add(lit_i32(b))))
            .unwrap();
        let want: Vec<i32> = xs.iter().map(|x| x * a + b).collect();
        prop_assert_eq!(out, want);
    }

    #[test]
    fn prop_filter_matches_host(
        xs in proptest::collection::vec(-1_000i32..1_000, 0..500),
        threshold in -1_000i32..1_000,
    ) {
        let Some(ctx) = ctx() else { return Ok(()) };
        let arr = ctx.create_array(&xs).unwrap();
        let out: Vec<i32> = ctx
            .run(&arr.query().filter(elem().ge(lit_i32(threshold))))
            .unwrap();
        let want: Vec<i32> = xs.iter().copied().filter(|x| *x >= threshold).collect();
        prop_assert_eq!(out, want);
    }

    #[test]
    fn prop_sum_and_count_match_host(
        xs in proptest::collection::vec(-1_000i32..1_000, 0..500),
        modulus in 2i32..9,
    ) {
        let Some(ctx) = ctx() else { return Ok(()) };
        let arr = ctx.create_array(&xs).unwrap();
        let query = || arr.query().filter(elem().rem(lit_i32(modulus)).eq(lit_i32(0)));
        let sum: i32 = ctx.reduce(&query().sum()).unwrap();
        let count: i32 = ctx.reduce(&query().count()).unwrap();
        let survivors: Vec<i32> = xs.iter().copied().filter(|x| x % modulus == 0).collect();
        prop_assert_eq!(sum, survivors.iter().sum::<i32>());
        prop_assert_eq!(count, survivors.len() as i32);
    }

    #[test]
    fn prop_zip_matches_host(
        pairs in proptest::collection::vec((-1_000i32..1_000, -1_000i32..1_000), 1..300),
    ) {
        let Some(ctx) = ctx() else { return Ok(()) };
        let (ls, rs): (Vec<i32>, Vec<i32>) = pairs.iter().copied().unzip();
        let left = ctx.create_array(&ls).unwrap();
        let right = ctx.create_array(&rs).unwrap();
        let out: Vec<i32> = ctx
            .run(&Query::zip(&left, &right, gpq::zip_left().sub(gpq::zip_right())).unwrap())
            .unwrap();
        let want: Vec<i32> = pairs.iter().map(|(l, r)| l - r).collect();
        prop_assert_eq!(out, want);
    }
}
