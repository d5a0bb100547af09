//! Editable scene model and its flattened, device-uploadable snapshot
//!
//! `Scene` is the mutable source description. `CompiledScene` is the
//! immutable-until-recompiled flattening consumed by render threads: POD
//! arrays per subsystem, used-kind sets for kernel parameter derivation
//! and per-subsystem dirty flags telling each thread what to re-upload
//! after an edit.

mod edit;

pub use edit::EditActionList;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::error::{RenderError, RenderResult};

/// Image maps are packed into at most this many page blocks.
pub const MAX_IMAGE_MAP_PAGES: usize = 8;

//------------------------------------------------------------------------------
// Closed kind sets
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraKind {
    Perspective,
    Orthographic,
    Environment,
    Stereo,
}

impl CameraKind {
    pub fn id(self) -> u32 {
        match self {
            CameraKind::Perspective => 0,
            CameraKind::Orthographic => 1,
            CameraKind::Environment => 2,
            CameraKind::Stereo => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    Matte,
    Mirror,
    Glass,
    Glossy,
    Metal,
    Null,
}

impl MaterialKind {
    pub fn id(self) -> u32 {
        match self {
            MaterialKind::Matte => 0,
            MaterialKind::Mirror => 1,
            MaterialKind::Glass => 2,
            MaterialKind::Glossy => 3,
            MaterialKind::Metal => 4,
            MaterialKind::Null => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MaterialKind::Matte => "MATTE",
            MaterialKind::Mirror => "MIRROR",
            MaterialKind::Glass => "GLASS",
            MaterialKind::Glossy => "GLOSSY",
            MaterialKind::Metal => "METAL",
            MaterialKind::Null => "NULL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    ConstFloat,
    ConstSpectrum,
    ImageMap,
    Scale,
    Mix,
    Checkerboard,
}

impl TextureKind {
    pub fn id(self) -> u32 {
        match self {
            TextureKind::ConstFloat => 0,
            TextureKind::ConstSpectrum => 1,
            TextureKind::ImageMap => 2,
            TextureKind::Scale => 3,
            TextureKind::Mix => 4,
            TextureKind::Checkerboard => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TextureKind::ConstFloat => "CONST_FLOAT",
            TextureKind::ConstSpectrum => "CONST_SPECTRUM",
            TextureKind::ImageMap => "IMAGEMAP",
            TextureKind::Scale => "SCALE",
            TextureKind::Mix => "MIX",
            TextureKind::Checkerboard => "CHECKERBOARD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Infinite,
    ConstantInfinite,
    Sky,
    Sun,
    Point,
    Spot,
    Distant,
    Triangle,
}

impl LightKind {
    pub fn id(self) -> u32 {
        match self {
            LightKind::Infinite => 0,
            LightKind::ConstantInfinite => 1,
            LightKind::Sky => 2,
            LightKind::Sun => 3,
            LightKind::Point => 4,
            LightKind::Spot => 5,
            LightKind::Distant => 6,
            LightKind::Triangle => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LightKind::Infinite => "INFINITE",
            LightKind::ConstantInfinite => "CONSTANTINFINITE",
            LightKind::Sky => "SKY",
            LightKind::Sun => "SUN",
            LightKind::Point => "POINT",
            LightKind::Spot => "SPOT",
            LightKind::Distant => "DISTANT",
            LightKind::Triangle => "TRIANGLE",
        }
    }

    /// Environment lights illuminate rays that leave the scene.
    pub fn is_environment(self) -> bool {
        matches!(
            self,
            LightKind::Infinite | LightKind::ConstantInfinite | LightKind::Sky
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageMapFormat {
    Byte,
    Half,
    Float,
}

impl ImageMapFormat {
    pub fn name(self) -> &'static str {
        match self {
            ImageMapFormat::Byte => "BYTE",
            ImageMapFormat::Half => "HALF",
            ImageMapFormat::Float => "FLOAT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageMapWrap {
    Repeat,
    Black,
    White,
    Clamp,
}

impl ImageMapWrap {
    pub fn name(self) -> &'static str {
        match self {
            ImageMapWrap::Repeat => "REPEAT",
            ImageMapWrap::Black => "BLACK",
            ImageMapWrap::White => "WHITE",
            ImageMapWrap::Clamp => "CLAMP",
        }
    }
}

//------------------------------------------------------------------------------
// Source scene
//------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SceneCamera {
    pub kind: CameraKind,
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub clipping_plane: bool,
}

impl Default for SceneCamera {
    fn default() -> Self {
        SceneCamera {
            kind: CameraKind::Perspective,
            eye: Vec3::new(0.0, 0.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 45.0_f32.to_radians(),
            clipping_plane: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SceneMesh {
    pub verts: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub cols: Vec<[f32; 3]>,
    pub alphas: Vec<f32>,
    pub tris: Vec<[u32; 3]>,
}

#[derive(Debug, Clone)]
pub struct SceneObject {
    pub mesh_index: u32,
    pub material_index: u32,
}

#[derive(Debug, Clone)]
pub struct SceneMaterial {
    pub kind: MaterialKind,
    pub base_color: [f32; 3],
    pub emission: [f32; 3],
    /// Optional texture driving the base color.
    pub texture_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SceneTexture {
    pub kind: TextureKind,
    pub value: [f32; 3],
    pub image_map_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SceneLight {
    pub kind: LightKind,
    pub emission: [f32; 3],
    pub position: Vec3,
    pub direction: Vec3,
}

impl SceneLight {
    pub fn environment(emission: [f32; 3]) -> Self {
        SceneLight {
            kind: LightKind::ConstantInfinite,
            emission,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Y,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SceneImageMap {
    pub width: u32,
    pub height: u32,
    pub channel_count: u32,
    pub format: ImageMapFormat,
    pub wrap: ImageMapWrap,
    /// Decoded pixel data, already converted to f32 by the loader.
    pub pixels: Vec<f32>,
}

impl SceneImageMap {
    /// Build from 8-bit storage; values normalize to [0, 1].
    pub fn from_byte_pixels(
        width: u32,
        height: u32,
        channel_count: u32,
        wrap: ImageMapWrap,
        pixels: &[u8],
    ) -> Self {
        SceneImageMap {
            width,
            height,
            channel_count,
            format: ImageMapFormat::Byte,
            wrap,
            pixels: pixels.iter().map(|&p| p as f32 / 255.0).collect(),
        }
    }

    /// Build from half-float storage.
    pub fn from_half_pixels(
        width: u32,
        height: u32,
        channel_count: u32,
        wrap: ImageMapWrap,
        pixels: &[half::f16],
    ) -> Self {
        SceneImageMap {
            width,
            height,
            channel_count,
            format: ImageMapFormat::Half,
            wrap,
            pixels: pixels.iter().map(|p| p.to_f32()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PhotonEntry {
    pub position: [f32; 3],
    pub radiance: [f32; 3],
}

#[derive(Debug, Clone, Default)]
pub struct PhotonGiCache {
    pub radiance_photons: Vec<PhotonEntry>,
    pub caustic_photons: Vec<PhotonEntry>,
}

/// Mutable source scene.
///
/// Mutators accumulate edit actions; the engine consumes them once inside
/// the begin/end scene-edit bracket.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub camera: SceneCamera,
    pub meshes: Vec<SceneMesh>,
    pub objects: Vec<SceneObject>,
    pub materials: Vec<SceneMaterial>,
    pub textures: Vec<SceneTexture>,
    pub lights: Vec<SceneLight>,
    pub image_maps: Vec<SceneImageMap>,
    pub photon_gi: Option<PhotonGiCache>,
    pub default_volume_index: u32,
    edit_actions: EditActionList,
}

impl Scene {
    pub fn new() -> Self {
        Scene::default()
    }

    pub fn set_camera(&mut self, camera: SceneCamera) {
        self.camera = camera;
        self.edit_actions.add(EditActionList::CAMERA);
    }

    pub fn add_mesh(&mut self, mesh: SceneMesh, material_index: u32) {
        self.meshes.push(mesh);
        self.objects.push(SceneObject {
            mesh_index: (self.meshes.len() - 1) as u32,
            material_index,
        });
        self.edit_actions.add(EditActionList::GEOMETRY);
    }

    pub fn add_material(&mut self, material: SceneMaterial) -> u32 {
        let new_kind = !self.materials.iter().any(|m| m.kind == material.kind);
        self.materials.push(material);
        self.edit_actions.add(EditActionList::MATERIALS);
        if new_kind {
            self.edit_actions.add(EditActionList::MATERIAL_TYPES);
        }
        (self.materials.len() - 1) as u32
    }

    pub fn update_material(&mut self, index: u32, material: SceneMaterial) {
        let kind_changed = self.materials[index as usize].kind != material.kind;
        self.materials[index as usize] = material;
        self.edit_actions.add(EditActionList::MATERIALS);
        if kind_changed {
            self.edit_actions.add(EditActionList::MATERIAL_TYPES);
        }
    }

    pub fn add_texture(&mut self, texture: SceneTexture) -> u32 {
        self.textures.push(texture);
        self.edit_actions.add(EditActionList::MATERIALS);
        (self.textures.len() - 1) as u32
    }

    pub fn add_light(&mut self, light: SceneLight) -> u32 {
        let new_kind = !self.lights.iter().any(|l| l.kind == light.kind);
        self.lights.push(light);
        self.edit_actions.add(EditActionList::LIGHTS);
        if new_kind {
            self.edit_actions.add(EditActionList::LIGHT_TYPES);
        }
        (self.lights.len() - 1) as u32
    }

    pub fn update_light(&mut self, index: u32, light: SceneLight) {
        let kind_changed = self.lights[index as usize].kind != light.kind;
        self.lights[index as usize] = light;
        self.edit_actions.add(EditActionList::LIGHTS);
        if kind_changed {
            self.edit_actions.add(EditActionList::LIGHT_TYPES);
        }
    }

    pub fn add_image_map(&mut self, map: SceneImageMap) -> u32 {
        self.image_maps.push(map);
        self.edit_actions.add(EditActionList::IMAGE_MAPS);
        (self.image_maps.len() - 1) as u32
    }

    pub fn set_photon_gi(&mut self, cache: Option<PhotonGiCache>) {
        self.photon_gi = cache;
        self.edit_actions.add(EditActionList::PHOTON_GI);
    }

    /// Actions accumulated since the last consume.
    pub fn pending_edit_actions(&self) -> EditActionList {
        self.edit_actions
    }

    /// Consume the accumulated actions.
    pub fn take_edit_actions(&mut self) -> EditActionList {
        self.edit_actions.take()
    }
}

//------------------------------------------------------------------------------
// Compiled (flattened) records
//------------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct CompiledCamera {
    pub eye: [f32; 3],
    pub fov_y: f32,
    pub forward: [f32; 3],
    pub kind: u32,
    pub right: [f32; 3],
    pub clipping_plane: u32,
    pub up: [f32; 3],
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompiledMesh {
    pub vert_offset: u32,
    pub vert_count: u32,
    pub tri_offset: u32,
    pub tri_count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompiledSceneObject {
    pub mesh_index: u32,
    pub material_index: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompiledMaterial {
    pub base_color: [f32; 3],
    pub kind: u32,
    pub emission: [f32; 3],
    /// u32::MAX when the material has no texture.
    pub texture_index: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompiledTexture {
    pub value: [f32; 3],
    pub kind: u32,
    /// u32::MAX when the texture references no image map.
    pub image_map_index: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompiledLight {
    pub emission: [f32; 3],
    pub kind: u32,
    pub position: [f32; 3],
    pub _pad0: u32,
    pub direction: [f32; 3],
    pub _pad1: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompiledImageMap {
    pub width: u32,
    pub height: u32,
    pub channel_count: u32,
    pub page_index: u32,
    pub pixels_offset: u32,
    pub wrap: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompiledPhoton {
    pub position: [f32; 3],
    pub _pad0: u32,
    pub radiance: [f32; 3],
    pub _pad1: u32,
}

fn kind_bit(id: u32) -> u32 {
    1 << id
}

//------------------------------------------------------------------------------
// CompiledScene
//------------------------------------------------------------------------------

/// Flattened, device-uploadable snapshot of the scene.
///
/// Read-only to all render threads while the engine is started; mutated
/// only by `recompile` inside the scene-edit bracket, during which every
/// thread is quiesced.
pub struct CompiledScene {
    // Camera
    pub camera: CompiledCamera,
    pub camera_kind: CameraKind,
    pub enable_camera_clipping_plane: bool,

    // Geometry
    pub verts: Vec<[f32; 4]>,
    pub normals: Vec<[f32; 4]>,
    pub tri_normals: Vec<[f32; 4]>,
    pub uvs: Vec<[f32; 2]>,
    pub cols: Vec<[f32; 4]>,
    pub alphas: Vec<f32>,
    pub tris: Vec<[u32; 4]>,
    pub mesh_descs: Vec<CompiledMesh>,
    pub world_bsphere_center: Vec3,
    pub world_bsphere_radius: f32,

    // Materials / textures
    pub mats: Vec<CompiledMaterial>,
    pub texs: Vec<CompiledTexture>,

    // Scene objects (mesh <=> material links)
    pub scene_objs: Vec<CompiledSceneObject>,

    // Lights
    pub light_defs: Vec<CompiledLight>,
    pub env_light_indices: Vec<u32>,
    pub light_index_offset_by_mesh: Vec<u32>,
    pub light_index_by_tri: Vec<u32>,
    pub lights_distribution: Vec<f32>,
    pub infinite_light_distribution: Vec<f32>,
    pub env_light_distributions: Vec<f32>,
    pub has_env_lights: bool,

    // Image maps
    pub image_map_descs: Vec<CompiledImageMap>,
    pub image_map_pages: Vec<Vec<f32>>,

    // Photon GI
    pub pgic_radiance_photons: Vec<CompiledPhoton>,
    pub pgic_caustic_photons: Vec<CompiledPhoton>,

    pub default_volume_index: u32,

    // Used-kind sets (bit masks over the closed kind ids)
    used_material_kinds: u32,
    used_texture_kinds: u32,
    used_light_kinds: u32,
    used_image_map_formats: u32,
    used_image_map_channel_counts: u32,
    used_image_map_wraps: u32,

    // Per-subsystem dirty flags, polled once per end-scene-edit
    pub was_camera_compiled: bool,
    pub was_geometry_compiled: bool,
    pub was_materials_compiled: bool,
    pub was_scene_objects_compiled: bool,
    pub was_lights_compiled: bool,
    pub was_image_maps_compiled: bool,
    pub was_photon_gi_compiled: bool,

    max_mem_page_size: u64,
}

impl std::fmt::Debug for CompiledScene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScene")
            .field("camera_kind", &self.camera_kind)
            .field("num_verts", &self.verts.len())
            .field("num_tris", &self.tris.len())
            .field("num_mesh_descs", &self.mesh_descs.len())
            .field("num_mats", &self.mats.len())
            .field("num_texs", &self.texs.len())
            .field("num_scene_objs", &self.scene_objs.len())
            .field("num_light_defs", &self.light_defs.len())
            .field("has_env_lights", &self.has_env_lights)
            .finish_non_exhaustive()
    }
}

impl CompiledScene {
    /// Flatten the whole scene; every dirty flag is left set.
    pub fn compile(scene: &Scene, max_mem_page_size: u64) -> RenderResult<Self> {
        let mut cscene = CompiledScene {
            camera: CompiledCamera::default(),
            camera_kind: CameraKind::Perspective,
            enable_camera_clipping_plane: false,
            verts: Vec::new(),
            normals: Vec::new(),
            tri_normals: Vec::new(),
            uvs: Vec::new(),
            cols: Vec::new(),
            alphas: Vec::new(),
            tris: Vec::new(),
            mesh_descs: Vec::new(),
            world_bsphere_center: Vec3::ZERO,
            world_bsphere_radius: 0.0,
            mats: Vec::new(),
            texs: Vec::new(),
            scene_objs: Vec::new(),
            light_defs: Vec::new(),
            env_light_indices: Vec::new(),
            light_index_offset_by_mesh: Vec::new(),
            light_index_by_tri: Vec::new(),
            lights_distribution: Vec::new(),
            infinite_light_distribution: Vec::new(),
            env_light_distributions: Vec::new(),
            has_env_lights: false,
            image_map_descs: Vec::new(),
            image_map_pages: Vec::new(),
            pgic_radiance_photons: Vec::new(),
            pgic_caustic_photons: Vec::new(),
            default_volume_index: scene.default_volume_index,
            used_material_kinds: 0,
            used_texture_kinds: 0,
            used_light_kinds: 0,
            used_image_map_formats: 0,
            used_image_map_channel_counts: 0,
            used_image_map_wraps: 0,
            was_camera_compiled: false,
            was_geometry_compiled: false,
            was_materials_compiled: false,
            was_scene_objects_compiled: false,
            was_lights_compiled: false,
            was_image_maps_compiled: false,
            was_photon_gi_compiled: false,
            max_mem_page_size,
        };

        cscene.compile_camera(scene);
        cscene.compile_geometry(scene);
        cscene.compile_materials(scene)?;
        cscene.compile_scene_objects(scene);
        cscene.compile_lights(scene);
        cscene.compile_image_maps(scene)?;
        cscene.compile_photon_gi(scene);

        Ok(cscene)
    }

    /// Re-flatten only the subsystems named by `edit_actions`.
    ///
    /// Dirty flags are reset first, then set for exactly the recompiled
    /// subsystems; render threads poll them once per end-scene-edit.
    pub fn recompile(&mut self, scene: &Scene, edit_actions: &EditActionList) -> RenderResult<()> {
        self.reset_dirty_flags();

        if edit_actions.has(EditActionList::CAMERA) {
            self.compile_camera(scene);
        }
        if edit_actions.has(EditActionList::GEOMETRY | EditActionList::INSTANCE_TRANS) {
            self.compile_geometry(scene);
            self.compile_scene_objects(scene);
        }
        if edit_actions.has(EditActionList::MATERIALS | EditActionList::MATERIAL_TYPES) {
            self.compile_materials(scene)?;
        }
        if edit_actions.has(EditActionList::LIGHTS | EditActionList::LIGHT_TYPES) {
            self.compile_lights(scene);
        }
        if edit_actions.has(EditActionList::IMAGE_MAPS) {
            self.compile_image_maps(scene)?;
        }
        if edit_actions.has(EditActionList::PHOTON_GI) {
            self.compile_photon_gi(scene);
        }

        Ok(())
    }

    pub fn reset_dirty_flags(&mut self) {
        self.was_camera_compiled = false;
        self.was_geometry_compiled = false;
        self.was_materials_compiled = false;
        self.was_scene_objects_compiled = false;
        self.was_lights_compiled = false;
        self.was_image_maps_compiled = false;
        self.was_photon_gi_compiled = false;
    }

    fn compile_camera(&mut self, scene: &Scene) {
        let cam = &scene.camera;
        let forward = (cam.target - cam.eye).normalize_or_zero();
        let right = forward.cross(cam.up).normalize_or_zero();
        let up = right.cross(forward);

        self.camera = CompiledCamera {
            eye: cam.eye.to_array(),
            fov_y: cam.fov_y,
            forward: forward.to_array(),
            kind: cam.kind.id(),
            right: right.to_array(),
            clipping_plane: cam.clipping_plane as u32,
            up: up.to_array(),
            _pad: 0,
        };
        self.camera_kind = cam.kind;
        self.enable_camera_clipping_plane = cam.clipping_plane;
        self.was_camera_compiled = true;
    }

    fn compile_geometry(&mut self, scene: &Scene) {
        self.verts.clear();
        self.normals.clear();
        self.tri_normals.clear();
        self.uvs.clear();
        self.cols.clear();
        self.alphas.clear();
        self.tris.clear();
        self.mesh_descs.clear();

        let mut bb_min = Vec3::splat(f32::INFINITY);
        let mut bb_max = Vec3::splat(f32::NEG_INFINITY);

        for mesh in &scene.meshes {
            let vert_offset = self.verts.len() as u32;
            let tri_offset = self.tris.len() as u32;

            for v in &mesh.verts {
                self.verts.push([v[0], v[1], v[2], 0.0]);
                bb_min = bb_min.min(Vec3::from_array(*v));
                bb_max = bb_max.max(Vec3::from_array(*v));
            }
            for n in &mesh.normals {
                self.normals.push([n[0], n[1], n[2], 0.0]);
            }
            self.uvs.extend_from_slice(&mesh.uvs);
            for c in &mesh.cols {
                self.cols.push([c[0], c[1], c[2], 1.0]);
            }
            self.alphas.extend_from_slice(&mesh.alphas);
            for t in &mesh.tris {
                self.tris.push([
                    t[0] + vert_offset,
                    t[1] + vert_offset,
                    t[2] + vert_offset,
                    0,
                ]);
                // Flat triangle normal
                let a = Vec3::from_array(mesh.verts[t[0] as usize]);
                let b = Vec3::from_array(mesh.verts[t[1] as usize]);
                let c = Vec3::from_array(mesh.verts[t[2] as usize]);
                let n = (b - a).cross(c - a).normalize_or_zero();
                self.tri_normals.push([n.x, n.y, n.z, 0.0]);
            }

            self.mesh_descs.push(CompiledMesh {
                vert_offset,
                vert_count: mesh.verts.len() as u32,
                tri_offset,
                tri_count: mesh.tris.len() as u32,
            });
        }

        if self.mesh_descs.is_empty() {
            self.world_bsphere_center = Vec3::ZERO;
            self.world_bsphere_radius = 0.0;
        } else {
            self.world_bsphere_center = (bb_min + bb_max) * 0.5;
            self.world_bsphere_radius = (bb_max - bb_min).length() * 0.5;
        }

        log::debug!(
            "Compiled geometry: {} vertices, {} triangles, {} meshes",
            self.verts.len(),
            self.tris.len(),
            self.mesh_descs.len()
        );
        self.was_geometry_compiled = true;
    }

    fn compile_materials(&mut self, scene: &Scene) -> RenderResult<()> {
        self.mats.clear();
        self.texs.clear();
        self.used_material_kinds = 0;
        self.used_texture_kinds = 0;

        for tex in &scene.textures {
            if let Some(i) = tex.image_map_index {
                if i as usize >= scene.image_maps.len() {
                    return Err(RenderError::config(format!(
                        "texture references unknown image map {i}"
                    )));
                }
            }
            self.used_texture_kinds |= kind_bit(tex.kind.id());
            self.texs.push(CompiledTexture {
                value: tex.value,
                kind: tex.kind.id(),
                image_map_index: tex.image_map_index.unwrap_or(u32::MAX),
                _pad: [0; 3],
            });
        }

        for mat in &scene.materials {
            if let Some(i) = mat.texture_index {
                if i as usize >= scene.textures.len() {
                    return Err(RenderError::config(format!(
                        "material references unknown texture {i}"
                    )));
                }
            }
            self.used_material_kinds |= kind_bit(mat.kind.id());
            self.mats.push(CompiledMaterial {
                base_color: mat.base_color,
                kind: mat.kind.id(),
                emission: mat.emission,
                texture_index: mat.texture_index.unwrap_or(u32::MAX),
            });
        }

        self.was_materials_compiled = true;
        Ok(())
    }

    fn compile_scene_objects(&mut self, scene: &Scene) {
        self.scene_objs.clear();
        for obj in &scene.objects {
            self.scene_objs.push(CompiledSceneObject {
                mesh_index: obj.mesh_index,
                material_index: obj.material_index,
                _pad: [0; 2],
            });
        }
        self.was_scene_objects_compiled = true;
    }

    fn compile_lights(&mut self, scene: &Scene) {
        self.light_defs.clear();
        self.env_light_indices.clear();
        self.used_light_kinds = 0;

        for (i, light) in scene.lights.iter().enumerate() {
            self.used_light_kinds |= kind_bit(light.kind.id());
            if light.kind.is_environment() {
                self.env_light_indices.push(i as u32);
            }
            self.light_defs.push(CompiledLight {
                emission: light.emission,
                kind: light.kind.id(),
                position: light.position.to_array(),
                _pad0: 0,
                direction: light.direction.to_array(),
                _pad1: 0,
            });
        }
        self.has_env_lights = !self.env_light_indices.is_empty();

        // Uniform power distribution over the light set; the sampling math
        // itself lives device-side.
        let n = self.light_defs.len();
        self.lights_distribution = if n > 0 {
            vec![1.0 / n as f32; n]
        } else {
            Vec::new()
        };
        let env_n = self.env_light_indices.len();
        self.infinite_light_distribution = if env_n > 0 {
            vec![1.0 / env_n as f32; env_n]
        } else {
            Vec::new()
        };
        self.env_light_distributions = self.infinite_light_distribution.clone();

        // Triangle lights indexed by mesh/triangle; none of the closed light
        // kinds is mesh-bound until Triangle lights reference geometry, so
        // the tables stay sized to the mesh set.
        self.light_index_offset_by_mesh = vec![0; scene.meshes.len()];
        self.light_index_by_tri.clear();

        log::debug!(
            "Compiled lights: {} definitions, {} environment",
            self.light_defs.len(),
            env_n
        );
        self.was_lights_compiled = true;
    }

    fn compile_image_maps(&mut self, scene: &Scene) -> RenderResult<()> {
        self.image_map_descs.clear();
        self.image_map_pages.clear();
        self.used_image_map_formats = 0;
        self.used_image_map_channel_counts = 0;
        self.used_image_map_wraps = 0;

        for im in &scene.image_maps {
            let float_count = im.pixels.len();
            let mem_size = (float_count * std::mem::size_of::<f32>()) as u64;
            if mem_size > self.max_mem_page_size {
                return Err(RenderError::out_of_device_memory(format!(
                    "an image map of {mem_size} bytes does not fit in a single {} byte page",
                    self.max_mem_page_size
                )));
            }

            // First page with room, else a new page
            let mut page = None;
            for (j, block) in self.image_map_pages.iter().enumerate() {
                if mem_size + (block.len() * std::mem::size_of::<f32>()) as u64
                    <= self.max_mem_page_size
                {
                    page = Some(j);
                    break;
                }
            }
            let page = match page {
                Some(p) => p,
                None => {
                    if self.image_map_pages.len() >= MAX_IMAGE_MAP_PAGES {
                        return Err(RenderError::out_of_device_memory(format!(
                            "more than {MAX_IMAGE_MAP_PAGES} pages of memory required for image maps"
                        )));
                    }
                    self.image_map_pages.push(Vec::new());
                    self.image_map_pages.len() - 1
                }
            };

            let fmt_bit = match im.format {
                ImageMapFormat::Byte => 1,
                ImageMapFormat::Half => 2,
                ImageMapFormat::Float => 4,
            };
            self.used_image_map_formats |= fmt_bit;
            self.used_image_map_channel_counts |= kind_bit(im.channel_count.min(31));
            let wrap = match im.wrap {
                ImageMapWrap::Repeat => 0,
                ImageMapWrap::Black => 1,
                ImageMapWrap::White => 2,
                ImageMapWrap::Clamp => 3,
            };
            self.used_image_map_wraps |= kind_bit(wrap);

            self.image_map_descs.push(CompiledImageMap {
                width: im.width,
                height: im.height,
                channel_count: im.channel_count,
                page_index: page as u32,
                pixels_offset: self.image_map_pages[page].len() as u32,
                wrap,
                _pad: [0; 2],
            });
            self.image_map_pages[page].extend_from_slice(&im.pixels);
        }

        if !self.image_map_pages.is_empty() {
            log::debug!("Image map page count: {}", self.image_map_pages.len());
        }
        self.was_image_maps_compiled = true;
        Ok(())
    }

    fn compile_photon_gi(&mut self, scene: &Scene) {
        self.pgic_radiance_photons.clear();
        self.pgic_caustic_photons.clear();

        if let Some(cache) = &scene.photon_gi {
            let to_pod = |p: &PhotonEntry| CompiledPhoton {
                position: p.position,
                _pad0: 0,
                radiance: p.radiance,
                _pad1: 0,
            };
            self.pgic_radiance_photons = cache.radiance_photons.iter().map(to_pod).collect();
            self.pgic_caustic_photons = cache.caustic_photons.iter().map(to_pod).collect();
        }
        self.was_photon_gi_compiled = true;
    }

    pub fn is_material_compiled(&self, kind: MaterialKind) -> bool {
        (self.used_material_kinds & kind_bit(kind.id())) != 0
    }

    pub fn is_texture_compiled(&self, kind: TextureKind) -> bool {
        (self.used_texture_kinds & kind_bit(kind.id())) != 0
    }

    pub fn is_light_compiled(&self, kind: LightKind) -> bool {
        (self.used_light_kinds & kind_bit(kind.id())) != 0
    }

    pub fn is_image_map_format_compiled(&self, format: ImageMapFormat) -> bool {
        let bit = match format {
            ImageMapFormat::Byte => 1,
            ImageMapFormat::Half => 2,
            ImageMapFormat::Float => 4,
        };
        (self.used_image_map_formats & bit) != 0
    }

    pub fn is_image_map_channel_count_compiled(&self, count: u32) -> bool {
        (self.used_image_map_channel_counts & kind_bit(count.min(31))) != 0
    }

    pub fn has_image_maps(&self) -> bool {
        !self.image_map_descs.is_empty()
    }

    pub fn has_photon_gi(&self) -> bool {
        !self.pgic_radiance_photons.is_empty() || !self.pgic_caustic_photons.is_empty()
    }

    pub fn has_volumes(&self) -> bool {
        self.default_volume_index != 0
    }

    /// Generated device code evaluating the used texture kinds.
    ///
    /// The snippet is part of the assembled kernel source, so a change in
    /// the used-texture set changes the kernel cache key.
    pub fn textures_evaluation_source(&self) -> String {
        let mut src = String::from("fn texture_evaluate(tex_index: u32, uv: vec2<f32>) -> vec3<f32> {\n");
        src.push_str("    let tex = textures[tex_index];\n    switch tex.kind {\n");
        for kind in [
            TextureKind::ConstFloat,
            TextureKind::ConstSpectrum,
            TextureKind::ImageMap,
            TextureKind::Scale,
            TextureKind::Mix,
            TextureKind::Checkerboard,
        ] {
            if self.is_texture_compiled(kind) {
                src.push_str(&format!(
                    "        case {}u: {{ return texture_evaluate_{}(tex, uv); }}\n",
                    kind.id(),
                    kind.name().to_lowercase()
                ));
            }
        }
        src.push_str("        default: { return vec3<f32>(0.0); }\n    }\n}\n");
        src
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_tri_mesh() -> SceneMesh {
        SceneMesh {
            verts: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            uvs: Vec::new(),
            cols: Vec::new(),
            alphas: Vec::new(),
            tris: vec![[0, 1, 2]],
        }
    }

    fn test_scene() -> Scene {
        let mut scene = Scene::new();
        let mat = scene.add_material(SceneMaterial {
            kind: MaterialKind::Matte,
            base_color: [0.8, 0.8, 0.8],
            emission: [0.0; 3],
            texture_index: None,
        });
        scene.add_mesh(one_tri_mesh(), mat);
        scene.add_light(SceneLight::environment([1.0, 1.0, 1.0]));
        scene.take_edit_actions();
        scene
    }

    #[test]
    fn compile_sets_all_dirty_flags() {
        let scene = test_scene();
        let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
        assert!(cscene.was_camera_compiled);
        assert!(cscene.was_geometry_compiled);
        assert!(cscene.was_materials_compiled);
        assert!(cscene.was_scene_objects_compiled);
        assert!(cscene.was_lights_compiled);
        assert!(cscene.was_image_maps_compiled);
        assert!(cscene.was_photon_gi_compiled);
        assert!(cscene.is_material_compiled(MaterialKind::Matte));
        assert!(!cscene.is_material_compiled(MaterialKind::Glass));
        assert!(cscene.has_env_lights);
    }

    #[test]
    fn recompile_marks_only_requested_subsystems() {
        let mut scene = test_scene();
        let mut cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();

        scene.update_light(0, SceneLight::environment([2.0, 2.0, 2.0]));
        let actions = scene.take_edit_actions();
        cscene.recompile(&scene, &actions).unwrap();

        assert!(cscene.was_lights_compiled);
        assert!(!cscene.was_camera_compiled);
        assert!(!cscene.was_geometry_compiled);
        assert!(!cscene.was_materials_compiled);
        assert_eq!(cscene.light_defs[0].emission, [2.0, 2.0, 2.0]);
    }

    #[test]
    fn light_kind_change_sets_type_action() {
        let mut scene = test_scene();
        scene.take_edit_actions();
        scene.add_light(SceneLight {
            kind: LightKind::Point,
            emission: [1.0; 3],
            position: Vec3::ONE,
            direction: Vec3::NEG_Y,
        });
        let actions = scene.pending_edit_actions();
        assert!(actions.has(EditActionList::LIGHTS));
        assert!(actions.has(EditActionList::LIGHT_TYPES));
    }

    #[test]
    fn image_map_paging_rejects_overflow() {
        let mut scene = test_scene();
        // Page size of 1 KB; each map is 256 floats = 1 KB, so the ninth
        // map needs a ninth page.
        for _ in 0..9 {
            scene.add_image_map(SceneImageMap {
                width: 16,
                height: 16,
                channel_count: 1,
                format: ImageMapFormat::Float,
                wrap: ImageMapWrap::Repeat,
                pixels: vec![0.5; 256],
            });
        }
        let err = CompiledScene::compile(&scene, 1024).unwrap_err();
        assert!(matches!(err, RenderError::OutOfDeviceMemory(_)));
    }

    #[test]
    fn oversized_image_map_is_rejected() {
        let mut scene = test_scene();
        scene.add_image_map(SceneImageMap {
            width: 64,
            height: 64,
            channel_count: 1,
            format: ImageMapFormat::Float,
            wrap: ImageMapWrap::Repeat,
            pixels: vec![0.5; 64 * 64],
        });
        let err = CompiledScene::compile(&scene, 1024).unwrap_err();
        assert!(matches!(err, RenderError::OutOfDeviceMemory(_)));
    }

    #[test]
    fn image_map_storage_formats_convert_to_f32() {
        let byte_map =
            SceneImageMap::from_byte_pixels(2, 1, 1, ImageMapWrap::Repeat, &[0, 255]);
        assert_eq!(byte_map.format, ImageMapFormat::Byte);
        assert_eq!(byte_map.pixels, vec![0.0, 1.0]);

        let half_map = SceneImageMap::from_half_pixels(
            1,
            1,
            1,
            ImageMapWrap::Clamp,
            &[half::f16::from_f32(0.5)],
        );
        assert_eq!(half_map.format, ImageMapFormat::Half);
        assert!((half_map.pixels[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn empty_subsystems_compile_to_empty_arrays() {
        let scene = Scene::new();
        let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
        assert!(cscene.light_defs.is_empty());
        assert!(cscene.lights_distribution.is_empty());
        assert!(cscene.image_map_descs.is_empty());
        assert!(cscene.mesh_descs.is_empty());
        assert_eq!(cscene.world_bsphere_radius, 0.0);
    }
}
