//! Kernel source assembly
//!
//! Device kernel source is concatenated from a fixed, ordered sequence of
//! WGSL fragments (type declarations first, then function bodies in
//! dependency order, then the micro-kernel entry points), prefixed with a
//! const block rendered from the compile-parameter string and two generated
//! segments: the Sobol direction table and the texture evaluation dispatch
//! for the scene's used texture set. The result is deterministic for an
//! unchanged scene/film/config state.

use std::fmt::Write;

use crate::config::SamplerType;
use crate::scene::CompiledScene;

pub const SOBOL_BITS: usize = 32;

/// Ordered fragment table; concatenation order is a dependency order.
const FRAGMENTS: &[(&str, &str)] = &[
    ("types", include_str!("../shaders/pt_types.wgsl")),
    ("random", include_str!("../shaders/pt_random.wgsl")),
    ("color", include_str!("../shaders/pt_color.wgsl")),
    ("filter", include_str!("../shaders/pt_filter.wgsl")),
    ("camera", include_str!("../shaders/pt_camera.wgsl")),
    ("texture", include_str!("../shaders/pt_texture.wgsl")),
    ("material", include_str!("../shaders/pt_material.wgsl")),
    ("light", include_str!("../shaders/pt_light.wgsl")),
    ("sampler", include_str!("../shaders/pt_sampler.wgsl")),
    ("film", include_str!("../shaders/pt_film.wgsl")),
];

const KERNELS_MICRO: &str = include_str!("../shaders/pt_kernels_micro.wgsl");

/// Device-side film merge program, assembled separately from the path
/// kernels (it binds the engine film, not a thread film).
pub const FILM_MERGE_SOURCE: &str = include_str!("../shaders/film_merge.wgsl");

/// WGSL has no preprocessor; fragments may carry `#include` markers for
/// editor tooling, which are stripped during assembly.
fn strip_includes(src: &str) -> String {
    src.lines()
        .filter(|l| !l.trim_start().starts_with("#include"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the `-D NAME[=VALUE]` parameter string into a WGSL const block.
///
/// Flags become `bool` consts, integral values `u32`, anything with a
/// decimal point `f32`. The micro kernels reference the numeric consts; the
/// flag consts exist so that a feature-set change changes the source text.
fn params_const_block(params: &str) -> String {
    let mut block = String::new();
    for token in params.split(" -D ").map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once('=') {
            Some((name, value)) => {
                if value.contains('.') {
                    writeln!(block, "const {name}: f32 = {value};").unwrap();
                } else {
                    writeln!(block, "const {name}: u32 = {value}u;").unwrap();
                }
            }
            None => {
                writeln!(block, "const {token}: bool = true;").unwrap();
            }
        }
    }
    block
}

/// Sobol direction vectors for the first `dimensions` dimensions.
///
/// Dimension 0 is the Van der Corput sequence; the following dimensions use
/// a small primitive-polynomial table.
pub fn sobol_directions(dimensions: u32) -> Vec<u32> {
    // (polynomial degree, coefficient bits, initial direction numbers)
    const TABLE: &[(u32, u32, &[u32])] = &[
        (1, 0, &[1]),
        (2, 1, &[1, 3]),
        (3, 1, &[1, 3, 1]),
        (3, 2, &[1, 1, 1]),
        (4, 1, &[1, 1, 3, 3]),
        (4, 4, &[1, 3, 5, 13]),
        (5, 2, &[1, 1, 5, 5, 17]),
    ];

    let mut directions = Vec::with_capacity(dimensions as usize * SOBOL_BITS);
    for dim in 0..dimensions as usize {
        if dim == 0 {
            for k in 0..SOBOL_BITS {
                directions.push(1u32 << (31 - k));
            }
            continue;
        }
        let (degree, coeffs, init) = TABLE[(dim - 1) % TABLE.len()];
        let degree = degree as usize;
        let mut v = [0u32; SOBOL_BITS];
        for k in 0..degree.min(SOBOL_BITS) {
            v[k] = init[k] << (31 - k);
        }
        for k in degree..SOBOL_BITS {
            v[k] = v[k - degree] ^ (v[k - degree] >> degree);
            for j in 0..degree - 1 {
                if (coeffs >> j) & 1 == 1 {
                    v[k] ^= v[k - j - 1];
                }
            }
        }
        directions.extend_from_slice(&v);
    }
    directions
}

fn sobol_table_source(dimensions: u32) -> String {
    let directions = sobol_directions(dimensions);
    let mut src = String::new();
    writeln!(
        src,
        "const SOBOL_DIRECTIONS: array<u32, {}> = array<u32, {}>(",
        directions.len(),
        directions.len()
    )
    .unwrap();
    for (i, d) in directions.iter().enumerate() {
        if i > 0 {
            src.push_str(", ");
        }
        write!(src, "{d}u").unwrap();
    }
    src.push_str("\n);\n");
    src
}

/// Sample dimensions the sampler consumes per camera sample.
pub const EYE_SAMPLE_DIMENSIONS: u32 = 2;

/// Assemble the full path-tracing kernel source.
pub fn assemble_kernel_source(
    params: &str,
    cscene: &CompiledScene,
    sampler_type: SamplerType,
) -> String {
    let mut src = String::new();

    src.push_str(&params_const_block(params));

    if sampler_type == SamplerType::Sobol {
        src.push_str(&sobol_table_source(EYE_SAMPLE_DIMENSIONS));
    }

    for (_, fragment) in FRAGMENTS {
        src.push_str(&strip_includes(fragment));
        src.push('\n');
    }

    // Scene-dependent texture evaluation dispatch
    src.push_str(&cscene.textures_evaluation_source());
    src.push('\n');

    src.push_str(&strip_includes(KERNELS_MICRO));
    src.push('\n');

    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;

    #[test]
    fn assembly_is_deterministic() {
        let scene = Scene::new();
        let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
        let params = " -D PARAM_ACCEL_BVH -D PARAM_MAX_PATH_DEPTH=5";
        let a = assemble_kernel_source(params, &cscene, SamplerType::Sobol);
        let b = assemble_kernel_source(params, &cscene, SamplerType::Sobol);
        assert_eq!(a, b);
    }

    #[test]
    fn params_render_as_consts() {
        let block = params_const_block(" -D PARAM_ACCEL_BVH -D PARAM_MAX_PATH_DEPTH=5 -D PARAM_RR_CAP=0.125000");
        assert!(block.contains("const PARAM_ACCEL_BVH: bool = true;"));
        assert!(block.contains("const PARAM_MAX_PATH_DEPTH: u32 = 5u;"));
        assert!(block.contains("const PARAM_RR_CAP: f32 = 0.125000;"));
    }

    #[test]
    fn sampler_choice_changes_the_source() {
        let scene = Scene::new();
        let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
        let sobol = assemble_kernel_source("", &cscene, SamplerType::Sobol);
        let random = assemble_kernel_source("", &cscene, SamplerType::Random);
        assert_ne!(sobol, random);
        assert!(sobol.contains("SOBOL_DIRECTIONS"));
    }

    #[test]
    fn sobol_directions_have_full_bit_tables() {
        let d = sobol_directions(2);
        assert_eq!(d.len(), 2 * SOBOL_BITS);
        assert_eq!(d[0], 1 << 31);
        // Every direction number must be non-zero
        assert!(d.iter().all(|&v| v != 0));
    }

    #[test]
    fn merge_program_carries_the_two_phase_entries() {
        for entry in [
            "film_merge_initialize",
            "film_merge_accumulate",
            "film_merge_finalize",
        ] {
            assert!(FILM_MERGE_SOURCE.contains(&format!("fn {entry}")));
        }
    }

    #[test]
    fn fragments_concatenate_in_fixed_order() {
        let scene = Scene::new();
        let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
        let src = assemble_kernel_source("", &cscene, SamplerType::Random);
        let types_at = src.find("struct Ray").unwrap();
        let kernels_at = src.find("fn advance_paths_splat_sample").unwrap();
        assert!(types_at < kernels_at);
    }
}
