mod common;

use anyhow::Result;
use common::{
    assert_close, binary_function, execute, f32_input, int_input, lower, lower_and_run, quantize,
    ramp, reference_batched_matmul, tensor, tensor_dyn,
};
use linalg_rs::ir::spec::{DType, Operation, ProgramBuilder};
use linalg_rs_ref_cpu::{CpuTensor, InterpreterError, RuntimeValue};

/// `lhs[a', b', m, k] x rhs[a'', b'', k, n]` with unit batch extents broadcast.
fn reference_broadcast_matmul(
    lhs: &[f64],
    lhs_batch: [usize; 2],
    rhs: &[f64],
    rhs_batch: [usize; 2],
    (m, k, n): (usize, usize, usize),
) -> Vec<f64> {
    let batch = [lhs_batch[0].max(rhs_batch[0]), lhs_batch[1].max(rhs_batch[1])];
    let pick = |extent: usize, index: usize| if extent == 1 { 0 } else { index };
    let mut out = Vec::with_capacity(batch[0] * batch[1] * m * n);
    for a in 0..batch[0] {
        for b in 0..batch[1] {
            let l = (pick(lhs_batch[0], a) * lhs_batch[1] + pick(lhs_batch[1], b)) * m * k;
            let r = (pick(rhs_batch[0], a) * rhs_batch[1] + pick(rhs_batch[1], b)) * k * n;
            out.extend(reference_batched_matmul(&lhs[l..l + m * k], &rhs[r..r + k * n], 1, m, k, n));
        }
    }
    out
}

#[test]
fn mm_multiplies_matrices() -> Result<()> {
    let function = binary_function(
        Operation::Mm,
        tensor(DType::F32, &[2, 3]),
        tensor(DType::F32, &[3, 2]),
        tensor(DType::F32, &[2, 2]),
    );
    let out = lower_and_run(
        function,
        &[
            f32_input(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?,
            f32_input(&[3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0])?,
        ],
    )?;
    assert_eq!(out.dims, vec![2, 2]);
    assert_eq!(out.to_f64_vec(), vec![58.0, 64.0, 139.0, 154.0]);
    Ok(())
}

#[test]
fn mm_with_dynamic_shapes_runs_when_extents_agree() -> Result<()> {
    let function = binary_function(
        Operation::Mm,
        tensor_dyn(DType::F32, &[None, None]),
        tensor_dyn(DType::F32, &[None, None]),
        tensor_dyn(DType::F32, &[None, None]),
    );
    let program = lower(function)?;

    let lhs = ramp(6);
    let rhs = ramp(12);
    let results = execute(
        &program,
        &[f32_input(&[2, 3], lhs.clone())?, f32_input(&[3, 4], rhs.clone())?],
    )?;
    let out = results[0].as_tensor().expect("tensor result");
    assert_eq!(out.dims, vec![2, 4]);
    assert_close(&out.to_f64_vec(), &reference_batched_matmul(&lhs, &rhs, 1, 2, 3, 4));

    let err = execute(
        &program,
        &[f32_input(&[2, 3], ramp(6))?, f32_input(&[4, 4], ramp(16))?],
    )
    .expect_err("contracting extents differ");
    assert_eq!(
        err,
        InterpreterError::AssertionFailed {
            message: "mismatching contracting dimension for mm".into()
        }
    );
    Ok(())
}

#[test]
fn statically_mismatched_mm_traps_at_run_time() -> Result<()> {
    let function = binary_function(
        Operation::Mm,
        tensor(DType::F32, &[2, 3]),
        tensor(DType::F32, &[4, 5]),
        tensor(DType::F32, &[2, 5]),
    );
    let program = lower(function)?;
    let err = execute(
        &program,
        &[f32_input(&[2, 3], ramp(6))?, f32_input(&[4, 5], ramp(20))?],
    )
    .expect_err("assertion traps");
    assert!(matches!(err, InterpreterError::AssertionFailed { .. }), "{err}");
    Ok(())
}

#[test]
fn matmul_of_vectors_and_matrices() -> Result<()> {
    let dot = lower_and_run(
        binary_function(
            Operation::Matmul,
            tensor(DType::F32, &[3]),
            tensor(DType::F32, &[3]),
            tensor(DType::F32, &[]),
        ),
        &[
            f32_input(&[3], vec![1.0, 2.0, 3.0])?,
            f32_input(&[3], vec![4.0, 5.0, 6.0])?,
        ],
    )?;
    assert!(dot.dims.is_empty());
    assert_eq!(dot.to_f64_vec(), vec![32.0]);

    let vecmat = lower_and_run(
        binary_function(
            Operation::Matmul,
            tensor(DType::F32, &[2]),
            tensor(DType::F32, &[2, 3]),
            tensor(DType::F32, &[3]),
        ),
        &[
            f32_input(&[2], vec![1.0, 2.0])?,
            f32_input(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?,
        ],
    )?;
    assert_eq!(vecmat.to_f64_vec(), vec![9.0, 12.0, 15.0]);

    let matvec = lower_and_run(
        binary_function(
            Operation::Matmul,
            tensor(DType::F32, &[2, 3]),
            tensor(DType::F32, &[3]),
            tensor(DType::F32, &[2]),
        ),
        &[
            f32_input(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?,
            f32_input(&[3], vec![1.0, 0.0, -1.0])?,
        ],
    )?;
    assert_eq!(matvec.to_f64_vec(), vec![-2.0, -2.0]);
    Ok(())
}

#[test]
fn matmul_broadcasts_static_batches() -> Result<()> {
    let lhs = ramp(2 * 4 * 5);
    let rhs = ramp(3 * 5 * 6);
    let out = lower_and_run(
        binary_function(
            Operation::Matmul,
            tensor(DType::F32, &[2, 1, 4, 5]),
            tensor(DType::F32, &[3, 5, 6]),
            tensor(DType::F32, &[2, 3, 4, 6]),
        ),
        &[
            f32_input(&[2, 1, 4, 5], lhs.clone())?,
            f32_input(&[3, 5, 6], rhs.clone())?,
        ],
    )?;
    assert_eq!(out.dims, vec![2, 3, 4, 6]);
    let expected = reference_broadcast_matmul(&lhs, [2, 1], &rhs, [1, 3], (4, 5, 6));
    assert_close(&out.to_f64_vec(), &expected);
    Ok(())
}

#[test]
fn matmul_broadcasts_dynamic_batches() -> Result<()> {
    let function = binary_function(
        Operation::Matmul,
        tensor_dyn(DType::F32, &[None, None, Some(2), Some(3)]),
        tensor_dyn(DType::F32, &[None, None, Some(3), Some(2)]),
        tensor_dyn(DType::F32, &[None, None, Some(2), Some(2)]),
    );
    let lhs = ramp(2 * 2 * 3);
    let rhs = ramp(3 * 3 * 2);
    let out = lower_and_run(
        function,
        &[
            f32_input(&[2, 1, 2, 3], lhs.clone())?,
            f32_input(&[1, 3, 3, 2], rhs.clone())?,
        ],
    )?;
    assert_eq!(out.dims, vec![2, 3, 2, 2]);
    let expected = reference_broadcast_matmul(&lhs, [2, 1], &rhs, [1, 3], (2, 3, 2));
    assert_close(&out.to_f64_vec(), &expected);
    Ok(())
}

#[test]
fn matmul_rejects_unbroadcastable_runtime_batches() -> Result<()> {
    let function = binary_function(
        Operation::Matmul,
        tensor_dyn(DType::F32, &[None, Some(2), Some(2)]),
        tensor_dyn(DType::F32, &[None, Some(2), Some(2)]),
        tensor_dyn(DType::F32, &[None, Some(2), Some(2)]),
    );
    let program = lower(function)?;
    let err = execute(
        &program,
        &[f32_input(&[2, 2, 2], ramp(8))?, f32_input(&[3, 2, 2], ramp(12))?],
    )
    .expect_err("2 and 3 do not broadcast");
    assert!(matches!(err, InterpreterError::AssertionFailed { .. }), "{err}");
    Ok(())
}

#[test]
fn bmm_promotes_mixed_float_operands() -> Result<()> {
    let lhs = ramp(2 * 2 * 3);
    let rhs = ramp(2 * 3 * 2);
    let out = lower_and_run(
        binary_function(
            Operation::Bmm,
            tensor(DType::F16, &[2, 2, 3]),
            tensor(DType::F32, &[2, 3, 2]),
            tensor(DType::F32, &[2, 2, 2]),
        ),
        &[
            RuntimeValue::Tensor(CpuTensor::from_f64(DType::F16, vec![2, 2, 3], lhs.clone())?),
            f32_input(&[2, 3, 2], rhs.clone())?,
        ],
    )?;
    assert_eq!(out.dtype, DType::F32);
    assert_close(&out.to_f64_vec(), &reference_batched_matmul(&lhs, &rhs, 2, 2, 3, 2));
    Ok(())
}

#[test]
fn quantized_unsigned_matmul_subtracts_zero_points() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    let lhs = builder.add_parameter(tensor(DType::Ui8, &[2, 2]));
    let rhs = builder.add_parameter(tensor(DType::Ui8, &[2, 2]));
    let lhs_q = quantize(&mut builder, lhs, 5);
    let rhs_q = quantize(&mut builder, rhs, 2);
    let out = builder.emit_single(
        Operation::Matmul,
        vec![lhs_q.into(), rhs_q.into()],
        tensor(DType::Si32, &[2, 2]),
    );
    let function = builder.finish("main", vec![out]);

    let out = lower_and_run(
        function,
        &[
            int_input(DType::Ui8, &[2, 2], vec![10, 20, 30, 40])?,
            int_input(DType::Ui8, &[2, 2], vec![1, 2, 3, 4])?,
        ],
    )?;
    // (lhs - 5) x (rhs - 2)
    assert_eq!(out.dtype, DType::Si32);
    assert_eq!(out.to_i64_vec(), vec![10, 30, 10, 70]);
    Ok(())
}

#[test]
fn quantized_vector_matmul_squeezes_the_result() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    let lhs = builder.add_parameter(tensor(DType::Si8, &[3]));
    let rhs = builder.add_parameter(tensor(DType::Si8, &[3]));
    let lhs_q = quantize(&mut builder, lhs, 1);
    let rhs_q = quantize(&mut builder, rhs, -1);
    let out = builder.emit_single(
        Operation::Matmul,
        vec![lhs_q.into(), rhs_q.into()],
        tensor(DType::Si32, &[]),
    );
    let function = builder.finish("main", vec![out]);

    let out = lower_and_run(
        function,
        &[
            int_input(DType::Si8, &[3], vec![1, 2, 3])?,
            int_input(DType::Si8, &[3], vec![-1, 0, 1])?,
        ],
    )?;
    // [0, 1, 2] . [0, 1, 2]
    assert!(out.dims.is_empty());
    assert_eq!(out.to_i64_vec(), vec![5]);
    Ok(())
}

#[test]
fn quantized_unsigned_bmm_shifts_values_and_zero_points() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    let lhs = builder.add_parameter(tensor(DType::Ui8, &[2, 2, 3]));
    let rhs = builder.add_parameter(tensor(DType::Ui8, &[2, 3, 2]));
    let lhs_q = quantize(&mut builder, lhs, 130);
    let rhs_q = quantize(&mut builder, rhs, 3);
    let out = builder.emit_single(
        Operation::Bmm,
        vec![lhs_q.into(), rhs_q.into()],
        tensor(DType::Si32, &[2, 2, 2]),
    );
    let function = builder.finish("main", vec![out]);

    let lhs_values: Vec<i64> = (0..12).map(|i| 100 + i * 13).collect();
    let rhs_values: Vec<i64> = (0..12).map(|i| (i * 41) % 256).collect();
    let out = lower_and_run(
        function,
        &[
            int_input(DType::Ui8, &[2, 2, 3], lhs_values.clone())?,
            int_input(DType::Ui8, &[2, 3, 2], rhs_values.clone())?,
        ],
    )?;

    let centered = |values: &[i64], zero_point: i64| -> Vec<f64> {
        values.iter().map(|v| (v - zero_point) as f64).collect()
    };
    let expected: Vec<i64> = reference_batched_matmul(
        &centered(&lhs_values, 130),
        &centered(&rhs_values, 3),
        2,
        2,
        3,
        2,
    )
    .into_iter()
    .map(|v| v as i64)
    .collect();
    assert_eq!(out.dtype, DType::Si32);
    assert_eq!(out.dims, vec![2, 2, 2]);
    assert_eq!(out.to_i64_vec(), expected);
    Ok(())
}

#[test]
fn matmul_collapses_a_single_dynamic_batch_axis() -> Result<()> {
    let function = binary_function(
        Operation::Matmul,
        tensor_dyn(DType::F32, &[Some(2), None, Some(4), Some(5)]),
        tensor(DType::F32, &[1, 5, 6]),
        tensor_dyn(DType::F32, &[Some(2), None, Some(4), Some(6)]),
    );
    let lhs = ramp(2 * 3 * 4 * 5);
    let rhs = ramp(5 * 6);
    let out = lower_and_run(
        function,
        &[
            f32_input(&[2, 3, 4, 5], lhs.clone())?,
            f32_input(&[1, 5, 6], rhs.clone())?,
        ],
    )?;
    assert_eq!(out.dims, vec![2, 3, 4, 6]);
    let expected = reference_broadcast_matmul(&lhs, [2, 3], &rhs, [1, 1], (4, 5, 6));
    assert_close(&out.to_f64_vec(), &expected);
    Ok(())
}
