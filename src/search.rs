//! Rate-distortion refinement of the quantization field.
//!
//! Three regimes refine the initial field by roundtripping the frame and
//! inspecting the result: the default metric-guided loop, a peak-descent
//! loop for the slowest effort tier, and a max-error-bounded loop. A
//! dispatcher picks the regime from the compression parameters.

use crate::adaptive_quant::{adjust_quant_field, initial_quant_dc, AC_QUANT};
use crate::ac_strategy::AcStrategyImage;
use crate::consts::{div_ceil, BLOCK_DIM};
use crate::error::{Error, Result};
use crate::image::{Image3F, ImageF};
use crate::pipeline::{AuxOut, ColorEncoding, Comparator, EncoderState, FrameCodec, ImageBundle};
use crate::types::SpeedTier;

/// Aggregates a per-pixel distance map into per-block tiles, honoring the
/// transform extents: every position covered by one transform receives
/// that transform's aggregate.
#[must_use]
pub fn tile_dist_map(
    distmap: &ImageF,
    tile_size: usize,
    margin: usize,
    ac_strategy: &AcStrategyImage,
) -> ImageF {
    let tile_xsize = div_ceil(distmap.width(), tile_size);
    let tile_ysize = div_ceil(distmap.height(), tile_size);
    let mut tile_distmap = ImageF::new(tile_xsize, tile_ysize);
    const BORDER_MUL: f32 = 0.98;
    const CORNER_MUL: f32 = 0.7;
    for tile_y in 0..tile_ysize {
        let strategy_row = ac_strategy.const_row(tile_y);
        for tile_x in 0..tile_xsize {
            let acs = strategy_row[tile_x];
            if !acs.is_first_block() {
                continue;
            }
            let this_tile_xsize = acs.covered_blocks_x() * tile_size;
            let this_tile_ysize = acs.covered_blocks_y() * tile_size;
            let y_begin = (tile_size * tile_y).saturating_sub(margin);
            let y_end = (tile_size * tile_y + this_tile_ysize + margin).min(distmap.height());
            let x_begin = (tile_size * tile_x).saturating_sub(margin);
            let x_end = (tile_size * tile_x + this_tile_xsize + margin).min(distmap.width());
            let mut dist_norm = 0.0f32;
            let mut pixels = 0.0f64;
            for y in y_begin..y_end {
                let mut ymul = 1.0f32;
                if margin != 0 && (y == y_begin || y == y_end - 1) {
                    ymul = BORDER_MUL;
                }
                let row = distmap.row(y);
                for x in x_begin..x_end {
                    let mut xmul = ymul;
                    if margin != 0 && (x == x_begin || x == x_end - 1) {
                        xmul = if xmul == 1.0 { BORDER_MUL } else { CORNER_MUL };
                    }
                    let mut v = row[x];
                    v *= v;
                    v *= v;
                    v *= v;
                    v *= v;
                    dist_norm += xmul * v;
                    pixels += xmul as f64;
                }
            }
            if pixels == 0.0 {
                pixels = 1.0;
            }
            // The 16th norm runs below the max norm; narrow the gap.
            const TILE_NORM: f64 = 1.2;
            let tile_dist = (TILE_NORM * (dist_norm as f64 / pixels).powf(1.0 / 16.0)) as f32;
            for iy in 0..acs.covered_blocks_y() {
                for ix in 0..acs.covered_blocks_x() {
                    tile_distmap.set(tile_x + ix, tile_y + iy, tile_dist);
                }
            }
        }
    }
    tile_distmap
}

/// Chebyshev distance from each cell to the nearest local distortion
/// peak; -1 where no peak's window reaches.
#[must_use]
pub fn dist_to_peak_map(
    field: &ImageF,
    peak_min: f32,
    local_radius: usize,
    peak_weight: f32,
) -> ImageF {
    let mut result = ImageF::filled(field.width(), field.height(), -1.0);
    for y0 in 0..field.height() {
        for x0 in 0..field.width() {
            let x_min = x0.saturating_sub(local_radius);
            let y_min = y0.saturating_sub(local_radius);
            let x_max = (x0 + 1 + local_radius).min(field.width());
            let y_max = (y0 + 1 + local_radius).min(field.height());
            let mut local_max = peak_min;
            for y in y_min..y_max {
                for x in x_min..x_max {
                    local_max = local_max.max(field.get(x, y));
                }
            }
            if field.get(x0, y0) > (1.0 - peak_weight) * peak_min + peak_weight * local_max {
                for y in y_min..y_max {
                    for x in x_min..x_max {
                        let dist = (y as i32 - y0 as i32)
                            .abs()
                            .max((x as i32 - x0 as i32).abs()) as f32;
                        let cur_dist = result.get(x, y);
                        if cur_dist < 0.0 || cur_dist > dist {
                            result.set(x, y, dist);
                        }
                    }
                }
            }
        }
    }
    result
}

/// Softens one quant value towards a ceiling; returns whether anything
/// changed.
fn adjust_quant_val(q: &mut f32, d: f32, factor: f32, quant_max: f32) -> bool {
    if *q >= 0.999 * quant_max {
        return false;
    }
    let inv_q = 1.0 / *q;
    let adj_inv_q = inv_q - factor / (d + 1.0);
    *q = 1.0 / adj_inv_q.max(1.0 / quant_max);
    true
}

fn dump_heatmaps(aux_out: &mut AuxOut, quant_field: &ImageF, tile_heatmap: &ImageF) {
    if !aux_out.want_debug() {
        return;
    }
    let mut inv_qmap = ImageF::new(quant_field.width(), quant_field.height());
    for y in 0..quant_field.height() {
        for x in 0..quant_field.width() {
            // Never zero.
            inv_qmap.set(x, y, 1.0 / quant_field.get(x, y));
        }
    }
    let iter = aux_out.num_butteraugli_iters;
    aux_out.dump_plane(&format!("quant_heatmap{:05}", iter), &inv_qmap);
    aux_out.dump_plane(&format!("tile_heatmap{:05}", iter), tile_heatmap);
}

fn trace_quant_field(label: &str, quant_field: &ImageF) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    for y in 0..quant_field.height() {
        let row: Vec<String> = quant_field
            .row(y)
            .iter()
            .map(|v| format!("{:.5}", v))
            .collect();
        log::trace!("{} row {}: {}", label, y, row.join(" "));
    }
}

fn roundtrip_linear(
    opsin: &Image3F,
    state: &EncoderState,
    codec: &mut dyn FrameCodec,
) -> Result<ImageBundle> {
    let decoded = codec.roundtrip(opsin, state, true, true)?;
    Ok(ImageBundle::new(decoded, ColorEncoding::LinearSrgb))
}

/// Default metric-guided refinement.
///
/// Iteratively roundtrips the frame, scales each block's quant by its
/// relative distortion overshoot, floors the field towards the initial
/// estimate after the first comparison round, and reverts per-block
/// increases that made nearby distortion worse.
pub fn find_best_quantization(
    linear: &ImageBundle,
    opsin: &Image3F,
    state: &mut EncoderState,
    codec: &mut dyn FrameCodec,
    comparator: &mut dyn Comparator,
    mut aux_out: Option<&mut AuxOut>,
) -> Result<()> {
    let butteraugli_target = state.cparams.butteraugli_distance;
    let max_iters = state.cparams.max_butteraugli_iters;
    comparator.set_reference(linear)?;
    let lower_is_better = comparator.good_quality_score() < comparator.bad_quality_score();
    let quant_dc = initial_quant_dc(butteraugli_target);

    let mut quant_field = state.initial_quant_field.clone();
    adjust_quant_field(&state.ac_strategy, &mut quant_field);
    let initial_quant_field = quant_field.clone();
    let mut last_quant_field = quant_field.clone();
    let mut last_tile_distmap_localopt: Option<ImageF> = None;

    let (initial_qf_min, initial_qf_max) = quant_field.min_max();
    let initial_qf_ratio = initial_qf_max / initial_qf_min;
    let qf_max_deviation_low = (250.0 / initial_qf_ratio).sqrt();
    let asymmetry = qf_max_deviation_low.min(2.0);
    let qf_lower = initial_qf_min / (asymmetry * qf_max_deviation_low);
    let qf_higher = initial_qf_max * (qf_max_deviation_low / asymmetry);
    assert!(qf_higher / qf_lower < 253.0);

    // Iteration index of the comparison against the unmodified field.
    const ORIGINAL_COMPARISON_ROUND: u32 = 1;
    const MAX_DISTANCE_INCREASE_FACTOR: f32 = 1.015;
    // Margins for the primary tile distmap; every entry is zero.
    const MARGINS: [usize; 100] = [0; 100];
    // Per-iteration exponents for the under-target relaxation; all zero,
    // which keeps the fast multiply-only branch active.
    const POW: [f32; 8] = [0.0; 8];
    const POW_MOD: [f32; 8] = [0.0; 8];

    for i in 0..=max_iters {
        trace_quant_field("quant field", &quant_field);
        state
            .quantizer
            .set_quant_field(quant_dc, &quant_field, &mut state.raw_quant_field);
        let decoded = roundtrip_linear(opsin, state, codec)?;
        let (mut diffmap, mut score) = comparator.compare_with(&decoded)?;
        if !lower_is_better {
            score = -score;
            diffmap.scale(-1.0);
        }
        let margin = MARGINS.get(i as usize).copied().unwrap_or(0);
        let tile_distmap = tile_dist_map(&diffmap, BLOCK_DIM, margin, &state.ac_strategy);
        let tile_distmap_localopt = tile_dist_map(&diffmap, BLOCK_DIM, 2, &state.ac_strategy);
        if let Some(aux) = aux_out.as_deref_mut() {
            dump_heatmaps(aux, &quant_field, &tile_distmap);
            aux.num_butteraugli_iters += 1;
        }
        {
            let (minval, maxval) = quant_field.min_max();
            log::debug!(
                "butteraugli iter {}/{}: distance {:.6}, quant range {:.6}..{:.6}, dc quant {:.6}",
                i,
                max_iters,
                score,
                minval,
                maxval,
                quant_dc
            );
        }

        if i > ORIGINAL_COMPARISON_ROUND {
            // Undo the last round where it increased the quant value AND
            // the nearby distance by more than a sliver.
            if let Some(last_localopt) = &last_tile_distmap_localopt {
                for y in 0..quant_field.height() {
                    for x in 0..quant_field.width() {
                        if quant_field.get(x, y) > last_quant_field.get(x, y)
                            && tile_distmap_localopt.get(x, y)
                                > MAX_DISTANCE_INCREASE_FACTOR * last_localopt.get(x, y)
                        {
                            quant_field.set(x, y, last_quant_field.get(x, y));
                        }
                    }
                }
            }
        }
        last_quant_field.copy_from(&quant_field);
        last_tile_distmap_localopt = Some(tile_distmap_localopt);
        if i == max_iters {
            break;
        }

        if i == ORIGINAL_COMPARISON_ROUND {
            // Don't let the search drop far below the initial estimate;
            // the AC field needs enough precision to damp oscillations
            // from the DC reconstruction.
            const INIT_MUL: f32 = 0.6;
            const ONE_MINUS_INIT_MUL: f32 = 1.0 - INIT_MUL;
            for y in 0..quant_field.height() {
                for x in 0..quant_field.width() {
                    let q = quant_field.get(x, y);
                    let clamp = ONE_MINUS_INIT_MUL * q + INIT_MUL * initial_quant_field.get(x, y);
                    if q < clamp {
                        quant_field.set(x, y, clamp.clamp(qf_lower, qf_higher));
                    }
                }
            }
        }

        let mut cur_pow = 0.0f32;
        if i < 7 {
            cur_pow = POW[i as usize] + (butteraugli_target - 1.0) * POW_MOD[i as usize];
            if cur_pow < 0.0 {
                cur_pow = 0.0;
            }
        }
        if cur_pow == 0.0 {
            for y in 0..quant_field.height() {
                for x in 0..quant_field.width() {
                    let diff = tile_distmap.get(x, y) / butteraugli_target;
                    let mut q = quant_field.get(x, y);
                    if diff > 1.0 {
                        let old = q;
                        q *= diff;
                        let qf_old = (old * state.quantizer.inv_global_scale() + 0.5) as i32;
                        let qf_new = (q * state.quantizer.inv_global_scale() + 0.5) as i32;
                        if qf_old == qf_new {
                            q = old + state.quantizer.scale();
                        }
                    }
                    quant_field.set(x, y, q.clamp(qf_lower, qf_higher));
                }
            }
        } else {
            for y in 0..quant_field.height() {
                for x in 0..quant_field.width() {
                    let diff = tile_distmap.get(x, y) / butteraugli_target;
                    let mut q = quant_field.get(x, y);
                    if diff <= 1.0 {
                        q *= diff.powf(cur_pow);
                    } else {
                        let old = q;
                        q *= diff;
                        let qf_old = (old * state.quantizer.inv_global_scale() + 0.5) as i32;
                        let qf_new = (q * state.quantizer.inv_global_scale() + 0.5) as i32;
                        if qf_old == qf_new {
                            q = old + state.quantizer.scale();
                        }
                    }
                    quant_field.set(x, y, q.clamp(qf_lower, qf_higher));
                }
            }
        }
    }
    state
        .quantizer
        .set_quant_field(quant_dc, &quant_field, &mut state.raw_quant_field);
    state.initial_quant_field = quant_field;
    Ok(())
}

/// Peak-descent refinement for the slowest effort tier.
///
/// Repeatedly softens quant values around distortion peaks, widening the
/// search radius, raising the DC quant and lifting the quant ceiling when
/// progress stalls. Two outer rounds; the second restarts from a field
/// scaled down by a quarter. The best field seen is restored at the end.
pub fn find_best_quantization_hq(
    linear: &ImageBundle,
    opsin: &Image3F,
    state: &mut EncoderState,
    codec: &mut dyn FrameCodec,
    comparator: &mut dyn Comparator,
    mut aux_out: Option<&mut AuxOut>,
) -> Result<()> {
    let butteraugli_target = state.cparams.butteraugli_distance;
    let max_iters = state.cparams.max_butteraugli_iters_guetzli_mode;
    comparator.set_reference(linear)?;
    let lower_is_better = comparator.good_quality_score() < comparator.bad_quality_score();

    let mut quant_field = state.initial_quant_field.clone();
    adjust_quant_field(&state.ac_strategy, &mut quant_field);
    let mut best_quant_field = quant_field.clone();
    let mut best_score = 1_000_000.0f32;

    const MAX_OUTER_ITERS: usize = 2;
    const ADJ_SPEED: [f32; MAX_OUTER_ITERS] = [0.1, 0.04];
    let mut outer_iter = 0usize;
    let mut butteraugli_iter = 0u32;
    let mut search_radius = 0usize;
    let mut quant_ceil = 5.0f32;
    let mut quant_dc = 1.2f32;
    let mut best_quant_dc = quant_dc;
    let mut num_stalling_iters = 0u32;

    loop {
        trace_quant_field("hq quant field", &quant_field);
        let (_qmin, qmax) = quant_field.min_max();
        butteraugli_iter += 1;
        state
            .quantizer
            .set_quant_field(quant_dc, &quant_field, &mut state.raw_quant_field);
        let decoded = roundtrip_linear(opsin, state, codec)?;
        let (mut diffmap, mut score) = comparator.compare_with(&decoded)?;
        if !lower_is_better {
            score = -score;
            diffmap.scale(-1.0);
        }
        let mut best_quant_updated = false;
        if score <= best_score {
            best_quant_field.copy_from(&quant_field);
            best_score = score.max(butteraugli_target);
            best_quant_updated = true;
            best_quant_dc = quant_dc;
            num_stalling_iters = 0;
        } else if outer_iter == 0 {
            num_stalling_iters += 1;
        }
        let tile_distmap = tile_dist_map(&diffmap, BLOCK_DIM, 0, &state.ac_strategy);
        if let Some(aux) = aux_out.as_deref_mut() {
            dump_heatmaps(aux, &quant_field, &tile_distmap);
            aux.num_butteraugli_iters += 1;
        }
        log::debug!(
            "hq butteraugli iter {}/{}{}: distance {:.6}, quant {:.6}..{:.6}, dc {:.6}, radius {}",
            butteraugli_iter,
            max_iters,
            if best_quant_updated { " (*)" } else { "" },
            score,
            quant_field.min_max().0,
            qmax,
            quant_dc,
            search_radius
        );
        if butteraugli_iter >= max_iters {
            break;
        }

        let mut changed = false;
        while !changed && score > butteraugli_target {
            for radius in 0..=search_radius {
                if changed {
                    break;
                }
                let dist_to_peak =
                    dist_to_peak_map(&tile_distmap, butteraugli_target, radius, 0.0);
                for y in 0..quant_field.height() {
                    for x in 0..quant_field.width() {
                        let d = dist_to_peak.get(x, y);
                        if d >= 0.0 {
                            let factor = ADJ_SPEED[outer_iter] * tile_distmap.get(x, y);
                            let mut q = quant_field.get(x, y);
                            if adjust_quant_val(&mut q, d, factor, quant_ceil) {
                                quant_field.set(x, y, q);
                                changed = true;
                            }
                        }
                    }
                }
            }
            if !changed || num_stalling_iters >= 3 {
                // Try to extend the search parameters.
                if search_radius < 4
                    && (qmax < 0.99 * quant_ceil || quant_ceil >= 3.0 + search_radius as f32)
                {
                    search_radius += 1;
                    continue;
                }
                if quant_dc < 0.4 * quant_ceil - 0.8 {
                    quant_dc += 0.2;
                    changed = true;
                    continue;
                }
                if quant_ceil < 8.0 {
                    quant_ceil += 0.5;
                    continue;
                }
                break;
            }
        }
        if !changed {
            outer_iter += 1;
            if outer_iter == MAX_OUTER_ITERS {
                break;
            }
            const QUANT_SCALE: f32 = 0.75;
            quant_field.scale(QUANT_SCALE);
            num_stalling_iters = 0;
        }
    }
    state
        .quantizer
        .set_quant_field(best_quant_dc, &best_quant_field, &mut state.raw_quant_field);
    state.initial_quant_field = best_quant_field;
    Ok(())
}

/// Max-error-bounded refinement in opsin space.
///
/// Targets a per-transform-block reconstruction error between half the
/// bound and the bound: blocks above the bound get a proportionally
/// stronger quant, blocks below half of it a proportionally weaker one.
pub fn find_best_quantization_max_error(
    opsin: &Image3F,
    state: &mut EncoderState,
    codec: &mut dyn FrameCodec,
    mut aux_out: Option<&mut AuxOut>,
) -> Result<()> {
    if state.cparams.max_error.iter().any(|&err| err <= 0.0) {
        return Err(Error::InvalidParams {
            param: "max_error",
            reason: "max-error mode requires positive per-channel bounds",
        });
    }
    let max_iters = state.cparams.max_butteraugli_iters;
    let quant_dc = 16.0 * (0.1 / state.cparams.butteraugli_distance).sqrt();
    let mut quant_field = state.initial_quant_field.clone();
    adjust_quant_field(&state.ac_strategy, &mut quant_field);

    let inv_max_err = [
        1.0 / state.cparams.max_error[0],
        1.0 / state.cparams.max_error[1],
        1.0 / state.cparams.max_error[2],
    ];

    for i in 0..=max_iters {
        state
            .quantizer
            .set_quant_field(quant_dc, &quant_field, &mut state.raw_quant_field);
        if let Some(aux) = aux_out.as_deref_mut() {
            aux.dump_xyb(&format!("ops{}", i), opsin);
        }
        let decoded = codec.roundtrip(opsin, state, false, false)?;
        if let Some(aux) = aux_out.as_deref_mut() {
            aux.dump_xyb(&format!("dec{}", i), &decoded);
        }

        for by in 0..state.frame_dim.ysize_blocks {
            let strategy_row = state.ac_strategy.const_row(by);
            for bx in 0..state.frame_dim.xsize_blocks {
                let acs = strategy_row[bx];
                if !acs.is_first_block() {
                    continue;
                }
                let mut max_error = 0.0f32;
                for c in 0..3 {
                    for y in by * BLOCK_DIM..(by + acs.covered_blocks_y()) * BLOCK_DIM {
                        if y >= decoded.height() {
                            continue;
                        }
                        let in_row = opsin.plane_row(c, y);
                        let dec_row = decoded.plane_row(c, y);
                        for x in bx * BLOCK_DIM..(bx + acs.covered_blocks_x()) * BLOCK_DIM {
                            if x >= decoded.width() {
                                continue;
                            }
                            max_error =
                                max_error.max((in_row[x] - dec_row[x]).abs() * inv_max_err[c]);
                        }
                    }
                }
                // Target an error between max_error/2 and max_error:
                // above the bound raise the qf, below half of it lower
                // the qf.
                let qf_mul = if max_error < 0.5 {
                    max_error * 2.0
                } else if max_error > 1.0 {
                    max_error
                } else {
                    1.0
                };
                for qy in by..by + acs.covered_blocks_y() {
                    for qx in bx..bx + acs.covered_blocks_x() {
                        quant_field.set(qx, qy, quant_field.get(qx, qy) * qf_mul);
                    }
                }
            }
        }
    }
    state
        .quantizer
        .set_quant_field(quant_dc, &quant_field, &mut state.raw_quant_field);
    state.initial_quant_field = quant_field;
    Ok(())
}

/// Chooses and runs a refinement regime from the compression parameters.
///
/// `linear` may be omitted for the regimes that never invoke the
/// comparator (max-error, falcon, uniform, fast tiers).
pub fn find_best_quantizer(
    linear: Option<&ImageBundle>,
    opsin: &Image3F,
    state: &mut EncoderState,
    codec: &mut dyn FrameCodec,
    comparator: &mut dyn Comparator,
    aux_out: Option<&mut AuxOut>,
    rescale: f32,
) -> Result<()> {
    let butteraugli_distance = state.cparams.butteraugli_distance;
    if state.cparams.max_error_mode {
        find_best_quantization_max_error(opsin, state, codec, aux_out)
    } else if state.cparams.speed_tier == SpeedTier::Falcon {
        let quant_dc = initial_quant_dc(butteraugli_distance);
        let quant_ac = AC_QUANT / butteraugli_distance;
        state
            .quantizer
            .set_quant(quant_dc, quant_ac, &mut state.raw_quant_field);
        Ok(())
    } else if state.cparams.uniform_quant > 0.0 {
        let quant = state.cparams.uniform_quant * rescale;
        state
            .quantizer
            .set_quant(quant, quant, &mut state.raw_quant_field);
        Ok(())
    } else if state.cparams.speed_tier > SpeedTier::Kitten {
        let quant_dc = initial_quant_dc(butteraugli_distance);
        adjust_quant_field(&state.ac_strategy, &mut state.initial_quant_field);
        state.quantizer.set_quant_field(
            quant_dc,
            &state.initial_quant_field,
            &mut state.raw_quant_field,
        );
        Ok(())
    } else {
        let linear = linear.ok_or(Error::MissingReference)?;
        if state.cparams.speed_tier == SpeedTier::Tortoise {
            find_best_quantization_hq(linear, opsin, state, codec, comparator, aux_out)
        } else {
            find_best_quantization(linear, opsin, state, codec, comparator, aux_out)
        }
    }
}
