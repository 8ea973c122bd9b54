//! Runtime emission of the scene-accessor GLSL ES module.
//!
//! The emitted text is a program fragment: it declares the data bindings
//! (`scene_vertices`, `scene_indices`, `bvh_nodes`, `scene_instances`) and
//! exports the query entry points and attribute accessors the caller's
//! shader stitches in. It deliberately carries no `#version` or
//! `precision` preamble; the including shader owns those.

use std::fmt::Write;

use crate::blas::BlasKind;
use crate::scene::MAX_TLAS_COUNT;
use crate::traverse::{SAH_TRAVERSE_STACK_SIZE, WIDE_TRAVERSE_STACK_SIZE};

/// Compile-time constants baked into one emission. Texture sizes are the
/// power-of-two row lengths accessor code divides flat indices by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessorParams {
    pub kind: BlasKind,
    pub vertex_texture_size: usize,
    pub index_texture_size: usize,
    pub node_texture_size: usize,
    pub instance_texture_size: usize,
    /// Largest instance list across all TLAS; zero disables instancing.
    pub instance_count: usize,
    pub tlas_instance_counts: [usize; MAX_TLAS_COUNT],
    pub triangle_count: usize,
    pub node_count: usize,
}

/// Assembles the full accessor text for the scene-wide node flavor.
pub fn emit(params: &AccessorParams) -> String {
    let mut out = String::with_capacity(16 * 1024);

    let stack = match params.kind {
        BlasKind::Sah => SAH_TRAVERSE_STACK_SIZE,
        BlasKind::Wide => WIDE_TRAVERSE_STACK_SIZE,
    };

    let _ = writeln!(
        out,
        "#define RF_PRIMITIVE_TEXTURE_SIZE {}",
        params.index_texture_size
    );
    let _ = writeln!(out, "#define RF_TRAVERSE_STACK_SIZE {stack}");
    let _ = writeln!(
        out,
        "#define RF_NODES_TEXTURE_SIZE {}",
        params.node_texture_size
    );
    let _ = writeln!(
        out,
        "#define RF_SCENE_TEXTURE_SIZE {}",
        params.vertex_texture_size
    );
    let _ = writeln!(
        out,
        "#define RF_INSTANCE_TEXTURE_SIZE {}",
        params.instance_texture_size
    );
    let _ = writeln!(out, "#define RF_INSTANCE_TRIANGLE_SPLIT_BIT 24");
    out.push_str("#define RF_TLAS_ID_MASK int(0x80000000u)\n");
    out.push_str("#define RF_IS_TLAS(x) (((x) & RF_TLAS_ID_MASK) != 0)\n");
    let _ = writeln!(out, "#define RF_INSTANCE_COUNT {}", params.instance_count);
    let _ = writeln!(out, "#define RF_TRIANGLE_COUNT {}", params.triangle_count);
    let _ = writeln!(out, "#define RF_BVH_NODE_COUNT {}", params.node_count);
    out.push_str("#define RF_RAY_MAX_DISTANCE 1.e27\n");

    let counts = params
        .tlas_instance_counts
        .map(|c| c.to_string())
        .join(", ");
    let _ = writeln!(
        out,
        "const int RF_TLAS_INSTANCE_COUNT[{MAX_TLAS_COUNT}] = int[]({counts});"
    );

    out.push_str("uniform highp sampler2DArray scene_vertices;\n");
    out.push_str("uniform highp isampler2DArray scene_indices;\n");
    out.push_str("uniform highp sampler2DArray bvh_nodes;\n");
    if params.instance_count > 0 {
        out.push_str("uniform highp sampler2DArray scene_instances;\n");
    }

    out.push_str(COMMON_HELPERS);
    out.push_str(ATTRIBUTE_ACCESSORS);
    if params.instance_count > 0 {
        out.push_str(INSTANCE_ACCESSORS);
    } else {
        out.push_str(INSTANCE_ACCESSOR_STUBS);
    }
    match params.kind {
        BlasKind::Sah => {
            out.push_str(SAH_NODE_FETCH);
            out.push_str(SAH_TRAVERSAL);
        }
        BlasKind::Wide => {
            out.push_str(WIDE_NODE_FETCH);
            out.push_str(WIDE_TRAVERSAL);
        }
    }
    out.push_str(QUERY_ENTRY_POINTS);

    out
}

const COMMON_HELPERS: &str = r#"
float rf_copysignf(float x, float y) {
    return intBitsToFloat((floatBitsToInt(x) & 0x7fffffff) | (floatBitsToInt(y) & int(0x80000000u)));
}

void rf_swapf(inout float a, inout float b) {
    float t = a;
    a = b;
    b = t;
}

bool is_valid_intersection(ivec4 intersection) {
    return intersection.x >= 0;
}

int rf_ads_id(int ads) {
    return RF_IS_TLAS(ads) ? (ads & ~RF_TLAS_ID_MASK) : ads;
}

vec3 rf_intersect_triangle(vec3 direction, vec3 origin, vec3 v0, vec3 v1, vec3 v2, float t_max)
{
    vec3 e1 = v1 - v0;
    vec3 e2 = v2 - v0;
    vec3 s1 = cross(direction, e2);
    float invd = 1.0 / dot(s1, e1);
    vec3 d = origin - v0;
    float b1 = dot(d, s1) * invd;
    vec3 s2 = cross(d, e1);
    float b2 = dot(direction, s2) * invd;
    float t = dot(e2, s2) * invd;
    if (b1 < 0.0 || b1 > 1.0 || b2 < 0.0 || b1 + b2 > 1.0 || t < 0.0 || t > t_max) {
        return vec3(0.0, 0.0, t_max);
    }
    return vec3(b1, b2, t);
}
"#;

const ATTRIBUTE_ACCESSORS: &str = r#"
ivec4 rf_face_blas(int blas, int i) {
    return texelFetch(scene_indices, ivec3(i % RF_PRIMITIVE_TEXTURE_SIZE, i / RF_PRIMITIVE_TEXTURE_SIZE, blas), 0);
}

vec3 rf_position_blas(int blas, int i) {
    return texelFetch(scene_vertices, ivec3(i % RF_SCENE_TEXTURE_SIZE, i / RF_SCENE_TEXTURE_SIZE, blas * 2 + 0), 0).xyz;
}

vec3 rf_normal_blas(int blas, int i) {
    return texelFetch(scene_vertices, ivec3(i % RF_SCENE_TEXTURE_SIZE, i / RF_SCENE_TEXTURE_SIZE, blas * 2 + 1), 0).xyz;
}

vec2 rf_tex_coords_blas(int blas, int i) {
    return vec2(
        texelFetch(scene_vertices, ivec3(i % RF_SCENE_TEXTURE_SIZE, i / RF_SCENE_TEXTURE_SIZE, blas * 2 + 0), 0).w,
        texelFetch(scene_vertices, ivec3(i % RF_SCENE_TEXTURE_SIZE, i / RF_SCENE_TEXTURE_SIZE, blas * 2 + 1), 0).w);
}

vec2 get_bary_coords(ivec4 intersection) {
    return intBitsToFloat(intersection.yz);
}

vec3 get_bary_coords3d(ivec4 intersection) {
    vec3 barys;
    barys.yz = intBitsToFloat(intersection.yz);
    barys.x = 1.0 - barys.y - barys.z;
    return barys;
}

float get_hit_distance(ivec4 intersection) {
    return intBitsToFloat(intersection.w);
}

int get_triangle_id(int ads, ivec4 intersection) {
#if RF_INSTANCE_COUNT
    return RF_IS_TLAS(ads) ? (((1 << RF_INSTANCE_TRIANGLE_SPLIT_BIT) - 1) & intersection.x) : intersection.x;
#else
    return intersection.x;
#endif
}

int get_instance_id(int ads, ivec4 intersection) {
#if RF_INSTANCE_COUNT
    return intersection.x >> RF_INSTANCE_TRIANGLE_SPLIT_BIT;
#else
    return -1;
#endif
}
"#;

const INSTANCE_ACCESSORS: &str = r#"
int get_blas_id(int ads, int instance) {
    int b = 4 * instance + 3;
    return floatBitsToInt(texelFetch(scene_instances, ivec3(b % RF_INSTANCE_TEXTURE_SIZE, b / RF_INSTANCE_TEXTURE_SIZE, rf_ads_id(ads)), 0).r);
}

mat4 get_object_transform(int ads, int instance) {
    int b = 4 * instance;
    vec4 r0 = texelFetch(scene_instances, ivec3((b + 0) % RF_INSTANCE_TEXTURE_SIZE, (b + 0) / RF_INSTANCE_TEXTURE_SIZE, rf_ads_id(ads)), 0);
    vec4 r1 = texelFetch(scene_instances, ivec3((b + 1) % RF_INSTANCE_TEXTURE_SIZE, (b + 1) / RF_INSTANCE_TEXTURE_SIZE, rf_ads_id(ads)), 0);
    vec4 r2 = texelFetch(scene_instances, ivec3((b + 2) % RF_INSTANCE_TEXTURE_SIZE, (b + 2) / RF_INSTANCE_TEXTURE_SIZE, rf_ads_id(ads)), 0);
    return mat4(
        vec4(r0.x, r1.x, r2.x, 0.0),
        vec4(r0.y, r1.y, r2.y, 0.0),
        vec4(r0.z, r1.z, r2.z, 0.0),
        vec4(r0.w, r1.w, r2.w, 1.0));
}

mat4 get_normal_transform(int ads, int instance) {
    return transpose(inverse(get_object_transform(ads, instance)));
}

vec3 transform_position_to_world(int ads, int instance, vec3 position) {
    return vec3(get_object_transform(ads, instance) * vec4(position, 1.0));
}

vec3 transform_direction_to_world(int ads, int instance, vec3 direction) {
    return vec3(get_object_transform(ads, instance) * vec4(direction, 0.0));
}

vec3 rf_object_ray_origin(int ads, int instance, vec3 origin) {
    return vec3(inverse(get_object_transform(ads, instance)) * vec4(origin, 1.0));
}

vec3 rf_object_ray_direction(int ads, int instance, vec3 direction) {
    return vec3(inverse(get_object_transform(ads, instance)) * vec4(direction, 0.0));
}

int rf_pack_instance_triangle(int triangle, int instance) {
    return (instance << RF_INSTANCE_TRIANGLE_SPLIT_BIT) | triangle;
}

int rf_hit_blas(int ads, ivec4 intersection) {
    return RF_IS_TLAS(ads) ? get_blas_id(ads, get_instance_id(ads, intersection)) : rf_ads_id(ads);
}
"#;

const INSTANCE_ACCESSOR_STUBS: &str = r#"
int get_blas_id(int ads, int instance) {
    return rf_ads_id(ads);
}

mat4 get_object_transform(int ads, int instance) {
    return mat4(1.0);
}

mat4 get_normal_transform(int ads, int instance) {
    return mat4(1.0);
}

vec3 transform_position_to_world(int ads, int instance, vec3 position) {
    return position;
}

vec3 transform_direction_to_world(int ads, int instance, vec3 direction) {
    return direction;
}

int rf_hit_blas(int ads, ivec4 intersection) {
    return rf_ads_id(ads);
}
"#;

const SAH_NODE_FETCH: &str = r#"
vec4 rf_node_bound_min(int ads, int i) {
    int b = 2 * i + 0;
    return texelFetch(bvh_nodes, ivec3(b % RF_NODES_TEXTURE_SIZE, b / RF_NODES_TEXTURE_SIZE, ads), 0);
}

vec4 rf_node_bound_max(int ads, int i) {
    int b = 2 * i + 1;
    return texelFetch(bvh_nodes, ivec3(b % RF_NODES_TEXTURE_SIZE, b / RF_NODES_TEXTURE_SIZE, ads), 0);
}

float rf_bounds_intersect(vec3 vmin, vec3 vmax, vec3 rpos, vec3 dirfrac, float tmax)
{
    float t0 = 0.0, t1 = tmax;
    for (int i = 0; i < 3; ++i) {
        float t_near = (vmin[i] - rpos[i]) * dirfrac[i];
        float t_far = (vmax[i] - rpos[i]) * dirfrac[i];
        if (dirfrac[i] < 0.0) rf_swapf(t_near, t_far);
        t0 = t_near > t0 ? t_near : t0;
        t1 = t_far < t1 ? t_far : t1;
        if (t0 > t1) return -1.0;
    }
    return 1.0;
}
"#;

const SAH_TRAVERSAL: &str = r#"
ivec4 query_shape_intersection(int ads, vec3 ray_origin, vec3 ray_direction, float tmax) {
    float min_distance = tmax;
    ivec4 min_intersection = ivec4(-1, 0, 0, floatBitsToInt(tmax));
#if RF_TRIANGLE_COUNT && RF_BVH_NODE_COUNT
    vec3 inv_dir = vec3(1.0) / ray_direction;
    bvec3 dir_is_neg = bvec3(inv_dir.x < 0.0, inv_dir.y < 0.0, inv_dir.z < 0.0);
    int to_visit = 0, current = 0;
    int nodes_to_visit[RF_TRAVERSE_STACK_SIZE];
    for (int loop_index = 0; loop_index < RF_BVH_NODE_COUNT; ++loop_index) {
        vec4 packed_min = rf_node_bound_min(ads, current);
        vec4 packed_max = rf_node_bound_max(ads, current);
        ivec2 node_info = ivec2(floatBitsToInt(packed_min.w), floatBitsToInt(packed_max.w));
        int node_offset = node_info.x;
        int n_prims = node_info.y & 0x0000FFFF;
        int axis = (node_info.y & 0x00FF0000) >> 16;
        if (rf_bounds_intersect(packed_min.xyz, packed_max.xyz, ray_origin, inv_dir, min_distance) > 0.0) {
            if (n_prims > 0) {
                for (int i = 0; i < n_prims; ++i) {
                    int prim = node_offset + i;
                    ivec4 face = rf_face_blas(ads, prim);
                    vec3 v0 = rf_position_blas(ads, face.x);
                    vec3 v1 = rf_position_blas(ads, face.y);
                    vec3 v2 = rf_position_blas(ads, face.z);
                    vec3 hit = rf_intersect_triangle(ray_direction, ray_origin, v0, v1, v2, min_distance);
                    if (hit.z < min_distance) {
                        min_distance = hit.z;
                        min_intersection = ivec4(prim, floatBitsToInt(hit.xy), floatBitsToInt(hit.z));
                    }
                }
                if (to_visit == 0) break;
                current = nodes_to_visit[--to_visit];
            } else {
                if (dir_is_neg[axis]) {
                    nodes_to_visit[to_visit++] = current + 1;
                    current = node_offset;
                } else {
                    nodes_to_visit[to_visit++] = node_offset;
                    current = current + 1;
                }
            }
        } else {
            if (to_visit == 0) break;
            current = nodes_to_visit[--to_visit];
        }
    }
#endif
    return min_intersection;
}

bool query_shape_occlusion(int ads, vec3 ray_origin, vec3 ray_direction, float tmax) {
#if RF_TRIANGLE_COUNT && RF_BVH_NODE_COUNT
    vec3 inv_dir = vec3(1.0) / ray_direction;
    bvec3 dir_is_neg = bvec3(inv_dir.x < 0.0, inv_dir.y < 0.0, inv_dir.z < 0.0);
    int to_visit = 0, current = 0;
    int nodes_to_visit[RF_TRAVERSE_STACK_SIZE];
    for (int loop_index = 0; loop_index < RF_BVH_NODE_COUNT; ++loop_index) {
        vec4 packed_min = rf_node_bound_min(ads, current);
        vec4 packed_max = rf_node_bound_max(ads, current);
        ivec2 node_info = ivec2(floatBitsToInt(packed_min.w), floatBitsToInt(packed_max.w));
        int node_offset = node_info.x;
        int n_prims = node_info.y & 0x0000FFFF;
        int axis = (node_info.y & 0x00FF0000) >> 16;
        if (rf_bounds_intersect(packed_min.xyz, packed_max.xyz, ray_origin, inv_dir, tmax) > 0.0) {
            if (n_prims > 0) {
                for (int i = 0; i < n_prims; ++i) {
                    int prim = node_offset + i;
                    ivec4 face = rf_face_blas(ads, prim);
                    vec3 v0 = rf_position_blas(ads, face.x);
                    vec3 v1 = rf_position_blas(ads, face.y);
                    vec3 v2 = rf_position_blas(ads, face.z);
                    vec3 hit = rf_intersect_triangle(ray_direction, ray_origin, v0, v1, v2, tmax);
                    if (hit.z < tmax) {
                        return true;
                    }
                }
                if (to_visit == 0) break;
                current = nodes_to_visit[--to_visit];
            } else {
                if (dir_is_neg[axis]) {
                    nodes_to_visit[to_visit++] = current + 1;
                    current = node_offset;
                } else {
                    nodes_to_visit[to_visit++] = node_offset;
                    current = current + 1;
                }
            }
        } else {
            if (to_visit == 0) break;
            current = nodes_to_visit[--to_visit];
        }
    }
#endif
    return false;
}
"#;

const WIDE_NODE_FETCH: &str = r#"
vec4 rf_node_origin_exyz(int ads, int i) {
    int b = 5 * i + 0;
    return texelFetch(bvh_nodes, ivec3(b % RF_NODES_TEXTURE_SIZE, b / RF_NODES_TEXTURE_SIZE, ads), 0);
}

ivec4 rf_node_links(int ads, int i) {
    int b = 5 * i + 1;
    return floatBitsToInt(texelFetch(bvh_nodes, ivec3(b % RF_NODES_TEXTURE_SIZE, b / RF_NODES_TEXTURE_SIZE, ads), 0));
}

ivec4 rf_node_bbox(int ads, int i, int word) {
    int b = 5 * i + 2 + word;
    return floatBitsToInt(texelFetch(bvh_nodes, ivec3(b % RF_NODES_TEXTURE_SIZE, b / RF_NODES_TEXTURE_SIZE, ads), 0));
}
"#;

const WIDE_TRAVERSAL: &str = r#"
void rf_intersect_children(int ads, int node_index, inout ivec2 node_group, inout ivec2 triangle_group, vec3 ray_origin, vec3 ray_direction, float ray_tmax)
{
    vec4 p = rf_node_origin_exyz(ads, node_index);
    ivec4 links = rf_node_links(ads, node_index);
    ivec4 bbox0 = rf_node_bbox(ads, node_index, 0);
    ivec4 bbox1 = rf_node_bbox(ads, node_index, 1);
    ivec4 bbox2 = rf_node_bbox(ads, node_index, 2);
    int bbox[12];
    bbox[0] = bbox0.x; bbox[1] = bbox0.y; bbox[2] = bbox0.z; bbox[3] = bbox0.w;
    bbox[4] = bbox1.x; bbox[5] = bbox1.y; bbox[6] = bbox1.z; bbox[7] = bbox1.w;
    bbox[8] = bbox2.x; bbox[9] = bbox2.y; bbox[10] = bbox2.z; bbox[11] = bbox2.w;

    int exyzmask = floatBitsToInt(p.w);
    int imask = (exyzmask >> 24) & 0xFF;
    int meta[2];
    meta[0] = links.z;
    meta[1] = links.w;

    const float ooeps = 1e-40;
    vec3 idir;
    idir.x = 1.0 / (abs(ray_direction.x) > ooeps ? ray_direction.x : rf_copysignf(ooeps, ray_direction.x));
    idir.y = 1.0 / (abs(ray_direction.y) > ooeps ? ray_direction.y : rf_copysignf(ooeps, ray_direction.y));
    idir.z = 1.0 / (abs(ray_direction.z) > ooeps ? ray_direction.z : rf_copysignf(ooeps, ray_direction.z));
    vec3 adjusted = vec3(
        intBitsToFloat((exyzmask & 0xFF) << 23),
        intBitsToFloat(((exyzmask >> 8) & 0xFF) << 23),
        intBitsToFloat(((exyzmask >> 16) & 0xFF) << 23)) * idir;
    vec3 org = (p.xyz - ray_origin) * idir;

    int hitmask = 0;
    for (int part = 0; part < 2; ++part) {
        int lo[3];
        int hi[3];
        for (int axis = 0; axis < 3; ++axis) {
            int lo_word = bbox[2 * axis + part];
            int hi_word = bbox[6 + 2 * axis + part];
            lo[axis] = ray_direction[axis] < 0.0 ? hi_word : lo_word;
            hi[axis] = ray_direction[axis] < 0.0 ? lo_word : hi_word;
        }
        for (int j = 0; j < 4; ++j) {
            int shift = 8 * j;
            vec3 tmin = vec3(
                float((lo[0] >> shift) & 0xFF) * adjusted.x + org.x,
                float((lo[1] >> shift) & 0xFF) * adjusted.y + org.y,
                float((lo[2] >> shift) & 0xFF) * adjusted.z + org.z);
            vec3 tmax = vec3(
                float((hi[0] >> shift) & 0xFF) * adjusted.x + org.x,
                float((hi[1] >> shift) & 0xFF) * adjusted.y + org.y,
                float((hi[2] >> shift) & 0xFF) * adjusted.z + org.z);
            float cmin = max(max(tmin.x, max(tmin.y, tmin.z)), 0.0);
            float cmax = min(min(tmax.x, min(tmax.y, tmax.z)), ray_tmax);
            if (cmin <= cmax) {
                int child_meta = (meta[part] >> shift) & 0xFF;
                hitmask = hitmask | ((child_meta >> 5) << (child_meta & 31));
            }
        }
    }

    node_group = ivec2(links.x, (hitmask & int(0xFF000000u)) | imask);
    triangle_group = ivec2(links.y, hitmask & 0x00FFFFFF);
}

ivec4 query_shape_intersection(int ads, vec3 ray_origin, vec3 ray_direction, float tmax) {
    float min_distance = tmax;
    ivec4 min_intersection = ivec4(-1, 0, 0, floatBitsToInt(tmax));
#if RF_TRIANGLE_COUNT && RF_BVH_NODE_COUNT
    int to_visit = 0;
    ivec2 nodes_to_visit[RF_TRAVERSE_STACK_SIZE];
    ivec2 node_group = ivec2(0, 0x1000000);
    ivec2 triangle_group = ivec2(0, 0);

    for (int loop_index = 0; loop_index < RF_BVH_NODE_COUNT; ++loop_index) {
        if ((node_group.y & int(0xFF000000u)) != 0) {
            int n = 0;
            for (int bit = 24; bit < 32; ++bit) {
                if ((node_group.y & (1 << bit)) != 0) {
                    n = bit - 24;
                    break;
                }
            }
            node_group.y = node_group.y & ~(1 << (n + 24));
            if ((node_group.y & int(0xFF000000u)) != 0) {
                nodes_to_visit[++to_visit] = node_group;
            }
            rf_intersect_children(ads, node_group.x + n, node_group, triangle_group, ray_origin, ray_direction, min_distance);
        } else {
            triangle_group = node_group;
            node_group = ivec2(0, 0);
        }

        int triangle_hits = triangle_group.y;
        int relative_index = 0;
        while (triangle_hits > 0) {
            if ((triangle_hits & 1) != 0) {
                int prim = triangle_group.x + relative_index;
                ivec4 face = rf_face_blas(ads, prim);
                vec3 v0 = rf_position_blas(ads, face.x);
                vec3 v1 = rf_position_blas(ads, face.y);
                vec3 v2 = rf_position_blas(ads, face.z);
                vec3 hit = rf_intersect_triangle(ray_direction, ray_origin, v0, v1, v2, min_distance);
                if (hit.z < min_distance) {
                    min_distance = hit.z;
                    min_intersection = ivec4(prim, floatBitsToInt(hit.xy), floatBitsToInt(hit.z));
                }
            }
            relative_index++;
            triangle_hits = triangle_hits >> 1;
        }

        if ((node_group.y & int(0xFF000000u)) == 0) {
            if (to_visit == 0) break;
            node_group = nodes_to_visit[to_visit--];
        }
    }
#endif
    return min_intersection;
}

bool query_shape_occlusion(int ads, vec3 ray_origin, vec3 ray_direction, float tmax) {
#if RF_TRIANGLE_COUNT && RF_BVH_NODE_COUNT
    int to_visit = 0;
    ivec2 nodes_to_visit[RF_TRAVERSE_STACK_SIZE];
    ivec2 node_group = ivec2(0, 0x1000000);
    ivec2 triangle_group = ivec2(0, 0);

    for (int loop_index = 0; loop_index < RF_BVH_NODE_COUNT; ++loop_index) {
        if ((node_group.y & int(0xFF000000u)) != 0) {
            int n = 0;
            for (int bit = 24; bit < 32; ++bit) {
                if ((node_group.y & (1 << bit)) != 0) {
                    n = bit - 24;
                    break;
                }
            }
            node_group.y = node_group.y & ~(1 << (n + 24));
            if ((node_group.y & int(0xFF000000u)) != 0) {
                nodes_to_visit[++to_visit] = node_group;
            }
            rf_intersect_children(ads, node_group.x + n, node_group, triangle_group, ray_origin, ray_direction, tmax);
        } else {
            triangle_group = node_group;
            node_group = ivec2(0, 0);
        }

        int triangle_hits = triangle_group.y;
        int relative_index = 0;
        while (triangle_hits > 0) {
            if ((triangle_hits & 1) != 0) {
                int prim = triangle_group.x + relative_index;
                ivec4 face = rf_face_blas(ads, prim);
                vec3 v0 = rf_position_blas(ads, face.x);
                vec3 v1 = rf_position_blas(ads, face.y);
                vec3 v2 = rf_position_blas(ads, face.z);
                vec3 hit = rf_intersect_triangle(ray_direction, ray_origin, v0, v1, v2, tmax);
                if (hit.z < tmax) {
                    return true;
                }
            }
            relative_index++;
            triangle_hits = triangle_hits >> 1;
        }

        if ((node_group.y & int(0xFF000000u)) == 0) {
            if (to_visit == 0) break;
            node_group = nodes_to_visit[to_visit--];
        }
    }
#endif
    return false;
}
"#;

const QUERY_ENTRY_POINTS: &str = r#"
ivec4 query_intersection(int ads, vec3 ray_origin, vec3 ray_direction, float tmax) {
#if RF_INSTANCE_COUNT
    if (RF_IS_TLAS(ads)) {
        float min_distance = tmax;
        ivec4 min_intersection = ivec4(-1, 0, 0, floatBitsToInt(tmax));
        int count = RF_TLAS_INSTANCE_COUNT[rf_ads_id(ads)];
        for (int i = 0; i < count; ++i) {
            vec3 object_origin = rf_object_ray_origin(ads, i, ray_origin);
            vec3 object_direction = rf_object_ray_direction(ads, i, ray_direction);
            ivec4 intersection = query_shape_intersection(get_blas_id(ads, i), object_origin, object_direction, min_distance);
            if (intBitsToFloat(intersection.w) < min_distance) {
                min_distance = intBitsToFloat(intersection.w);
                min_intersection = intersection;
                min_intersection.x = rf_pack_instance_triangle(intersection.x, i);
            }
        }
        return min_intersection;
    }
    return query_shape_intersection(rf_ads_id(ads), ray_origin, ray_direction, tmax);
#else
    return query_shape_intersection(rf_ads_id(ads), ray_origin, ray_direction, tmax);
#endif
}

bool query_occlusion(int ads, vec3 ray_origin, vec3 ray_direction, float tmax) {
#if RF_INSTANCE_COUNT
    if (RF_IS_TLAS(ads)) {
        int count = RF_TLAS_INSTANCE_COUNT[rf_ads_id(ads)];
        for (int i = 0; i < count; ++i) {
            vec3 object_origin = rf_object_ray_origin(ads, i, ray_origin);
            vec3 object_direction = rf_object_ray_direction(ads, i, ray_direction);
            if (query_shape_occlusion(get_blas_id(ads, i), object_origin, object_direction, tmax)) {
                return true;
            }
        }
        return false;
    }
    return query_shape_occlusion(rf_ads_id(ads), ray_origin, ray_direction, tmax);
#else
    return query_shape_occlusion(rf_ads_id(ads), ray_origin, ray_direction, tmax);
#endif
}

ivec4 get_face(int ads, ivec4 intersection) {
    return rf_face_blas(rf_hit_blas(ads, intersection), get_triangle_id(ads, intersection));
}

vec3 get_position(int ads, ivec4 intersection, int i) {
    vec3 position = rf_position_blas(rf_hit_blas(ads, intersection), i);
#if RF_INSTANCE_COUNT
    if (RF_IS_TLAS(ads)) {
        return transform_position_to_world(ads, get_instance_id(ads, intersection), position);
    }
#endif
    return position;
}

vec3 get_normal(int ads, ivec4 intersection, int i) {
    vec3 normal = normalize(rf_normal_blas(rf_hit_blas(ads, intersection), i));
#if RF_INSTANCE_COUNT
    if (RF_IS_TLAS(ads)) {
        int instance = get_instance_id(ads, intersection);
        return normalize(vec3(get_normal_transform(ads, instance) * vec4(normal, 0.0)));
    }
#endif
    return normal;
}

vec2 get_tex_coords(int ads, ivec4 intersection, int i) {
    return rf_tex_coords_blas(rf_hit_blas(ads, intersection), i);
}

vec3 get_interpolated_position(int ads, ivec4 intersection) {
    int blas = rf_hit_blas(ads, intersection);
    ivec4 face = rf_face_blas(blas, get_triangle_id(ads, intersection));
    vec3 b = get_bary_coords3d(intersection);
    vec3 position = rf_position_blas(blas, face.x) * b.x
        + rf_position_blas(blas, face.y) * b.y
        + rf_position_blas(blas, face.z) * b.z;
#if RF_INSTANCE_COUNT
    if (RF_IS_TLAS(ads)) {
        return transform_position_to_world(ads, get_instance_id(ads, intersection), position);
    }
#endif
    return position;
}

vec3 get_interpolated_normal(int ads, ivec4 intersection) {
    int blas = rf_hit_blas(ads, intersection);
    ivec4 face = rf_face_blas(blas, get_triangle_id(ads, intersection));
    vec3 b = get_bary_coords3d(intersection);
    vec3 normal = normalize(rf_normal_blas(blas, face.x) * b.x
        + rf_normal_blas(blas, face.y) * b.y
        + rf_normal_blas(blas, face.z) * b.z);
#if RF_INSTANCE_COUNT
    if (RF_IS_TLAS(ads)) {
        int instance = get_instance_id(ads, intersection);
        return normalize(vec3(get_normal_transform(ads, instance) * vec4(normal, 0.0)));
    }
#endif
    return normal;
}

vec2 get_interpolated_tex_coords(int ads, ivec4 intersection) {
    int blas = rf_hit_blas(ads, intersection);
    ivec4 face = rf_face_blas(blas, get_triangle_id(ads, intersection));
    vec3 b = get_bary_coords3d(intersection);
    return rf_tex_coords_blas(blas, face.x) * b.x
        + rf_tex_coords_blas(blas, face.y) * b.y
        + rf_tex_coords_blas(blas, face.z) * b.z;
}

vec3 get_geom_normal(int ads, ivec4 intersection) {
    int blas = rf_hit_blas(ads, intersection);
    ivec4 face = rf_face_blas(blas, get_triangle_id(ads, intersection));
    vec3 v0 = rf_position_blas(blas, face.x);
    vec3 v1 = rf_position_blas(blas, face.y);
    vec3 v2 = rf_position_blas(blas, face.z);
    vec3 normal = normalize(cross(v1 - v0, v2 - v0));
#if RF_INSTANCE_COUNT
    if (RF_IS_TLAS(ads)) {
        int instance = get_instance_id(ads, intersection);
        return normalize(vec3(get_normal_transform(ads, instance) * vec4(normal, 0.0)));
    }
#endif
    return normal;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kind: BlasKind, instances: usize) -> AccessorParams {
        AccessorParams {
            kind,
            vertex_texture_size: 64,
            index_texture_size: 32,
            node_texture_size: 128,
            instance_texture_size: 8,
            instance_count: instances,
            tlas_instance_counts: [instances, 0, 0, 0, 0, 0, 0, 0],
            triangle_count: 100,
            node_count: 40,
        }
    }

    #[test]
    fn emission_is_deterministic() {
        let p = params(BlasKind::Wide, 2);
        assert_eq!(emit(&p), emit(&p));
    }

    #[test]
    fn no_version_directive_is_emitted() {
        let text = emit(&params(BlasKind::Wide, 2));
        assert!(!text.contains("#version"));
    }

    #[test]
    fn exported_surface_is_present() {
        for kind in [BlasKind::Sah, BlasKind::Wide] {
            let text = emit(&params(kind, 2));
            for name in [
                "ivec4 query_intersection(",
                "bool query_occlusion(",
                "ivec4 get_face(",
                "vec3 get_position(",
                "vec3 get_normal(",
                "vec2 get_tex_coords(",
                "vec3 get_interpolated_position(",
                "vec3 get_interpolated_normal(",
                "vec2 get_interpolated_tex_coords(",
                "vec3 get_geom_normal(",
                "vec2 get_bary_coords(",
                "vec3 get_bary_coords3d(",
                "float get_hit_distance(",
                "int get_blas_id(",
                "int get_instance_id(",
                "int get_triangle_id(",
                "mat4 get_object_transform(",
                "mat4 get_normal_transform(",
                "vec3 transform_position_to_world(",
                "vec3 transform_direction_to_world(",
            ] {
                assert!(text.contains(name), "{kind:?} accessor missing {name}");
            }
        }
    }

    #[test]
    fn bindings_match_uniform_declarations() {
        let text = emit(&params(BlasKind::Wide, 2));
        assert!(text.contains("uniform highp sampler2DArray scene_vertices;"));
        assert!(text.contains("uniform highp isampler2DArray scene_indices;"));
        assert!(text.contains("uniform highp sampler2DArray bvh_nodes;"));
        assert!(text.contains("uniform highp sampler2DArray scene_instances;"));

        let no_tlas = emit(&params(BlasKind::Wide, 0));
        assert!(!no_tlas.contains("scene_instances"));
    }

    #[test]
    fn constants_reflect_params() {
        let text = emit(&params(BlasKind::Sah, 0));
        assert!(text.contains("#define RF_PRIMITIVE_TEXTURE_SIZE 32"));
        assert!(text.contains("#define RF_SCENE_TEXTURE_SIZE 64"));
        assert!(text.contains("#define RF_NODES_TEXTURE_SIZE 128"));
        assert!(text.contains("#define RF_TRAVERSE_STACK_SIZE 32"));
        let wide = emit(&params(BlasKind::Wide, 0));
        assert!(wide.contains("#define RF_TRAVERSE_STACK_SIZE 16"));
    }

    #[test]
    fn flavor_selects_traversal_program() {
        let sah = emit(&params(BlasKind::Sah, 0));
        assert!(sah.contains("rf_node_bound_min"));
        assert!(!sah.contains("rf_intersect_children"));
        let wide = emit(&params(BlasKind::Wide, 0));
        assert!(wide.contains("rf_intersect_children"));
        assert!(!wide.contains("rf_node_bound_min"));
    }
}
