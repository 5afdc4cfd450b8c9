//! Integer BT.601 conversions between the raw BGRA frames the pipeline
//! carries and the planar/packed YUV layouts the codec and cameras speak.
//!
//! Reference implementations favoring correctness; callers reuse their
//! destination buffers so the hot path does not allocate.

/// Convert one BT.601 YUV sample to RGB.
///
/// R = 1.164(Y-16) + 1.596(V-128)
/// G = 1.164(Y-16) - 0.813(V-128) - 0.391(U-128)
/// B = 1.164(Y-16) + 2.018(U-128)
#[inline]
fn yuv_to_rgb(y: i32, u: i32, v: i32) -> (u8, u8, u8) {
    // Scale factors (multiplied by 256 for integer math)
    const Y_SCALE: i32 = 298; // 1.164 * 256
    const V_TO_R: i32 = 409; // 1.596 * 256
    const U_TO_G: i32 = 100; // 0.391 * 256
    const V_TO_G: i32 = 208; // 0.813 * 256
    const U_TO_B: i32 = 516; // 2.018 * 256

    let y = y - 16;
    let u = u - 128;
    let v = v - 128;

    let r = (Y_SCALE * y + V_TO_R * v + 128) >> 8;
    let g = (Y_SCALE * y - U_TO_G * u - V_TO_G * v + 128) >> 8;
    let b = (Y_SCALE * y + U_TO_B * u + 128) >> 8;

    (
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    )
}

/// Convert one RGB pixel to a BT.601 YUV sample (studio swing), the exact
/// inverse pairing of [`yuv_to_rgb`].
#[inline]
fn rgb_to_yuv(r: i32, g: i32, b: i32) -> (u8, u8, u8) {
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;

    (
        y.clamp(16, 235) as u8,
        u.clamp(16, 240) as u8,
        v.clamp(16, 240) as u8,
    )
}

/// Convert a BGRA frame into separate I420 planes.
///
/// Chroma is averaged over each 2x2 block, so `width` and `height` must be
/// even. Plane lengths: `y` is `width * height`, `u` and `v` are a quarter
/// of that. Alpha is discarded.
pub fn bgra_to_i420(src: &[u8], width: usize, height: usize, y: &mut [u8], u: &mut [u8], v: &mut [u8]) {
    debug_assert!(width % 2 == 0 && height % 2 == 0);
    debug_assert!(src.len() >= width * height * 4);
    debug_assert!(y.len() >= width * height);
    debug_assert!(u.len() >= width * height / 4 && v.len() >= width * height / 4);

    let half_w = width / 2;

    for row in 0..height {
        for col in 0..width {
            let px = (row * width + col) * 4;
            let (ys, _, _) = rgb_to_yuv(
                i32::from(src[px + 2]),
                i32::from(src[px + 1]),
                i32::from(src[px]),
            );
            y[row * width + col] = ys;
        }
    }

    // 2x2 average for the chroma planes
    for row in 0..height / 2 {
        for col in 0..half_w {
            let mut u_sum = 0i32;
            let mut v_sum = 0i32;
            for dy in 0..2 {
                for dx in 0..2 {
                    let px = ((row * 2 + dy) * width + col * 2 + dx) * 4;
                    let (_, us, vs) = rgb_to_yuv(
                        i32::from(src[px + 2]),
                        i32::from(src[px + 1]),
                        i32::from(src[px]),
                    );
                    u_sum += i32::from(us);
                    v_sum += i32::from(vs);
                }
            }
            u[row * half_w + col] = ((u_sum + 2) / 4) as u8;
            v[row * half_w + col] = ((v_sum + 2) / 4) as u8;
        }
    }
}

/// Convert I420 planes (with arbitrary strides) back into a BGRA frame.
///
/// Decoders commonly pad their rows, so each plane carries its own stride.
/// Alpha is set to 255.
#[allow(clippy::too_many_arguments)]
pub fn i420_to_bgra(
    y: &[u8],
    u: &[u8],
    v: &[u8],
    y_stride: usize,
    u_stride: usize,
    v_stride: usize,
    width: usize,
    height: usize,
    dst: &mut [u8],
) {
    debug_assert!(width % 2 == 0 && height % 2 == 0);
    debug_assert!(dst.len() >= width * height * 4);

    for row in 0..height {
        for col in 0..width {
            let y_val = i32::from(y[row * y_stride + col]);
            let u_val = i32::from(u[(row / 2) * u_stride + col / 2]);
            let v_val = i32::from(v[(row / 2) * v_stride + col / 2]);

            let (r, g, b) = yuv_to_rgb(y_val, u_val, v_val);

            let px = (row * width + col) * 4;
            dst[px] = b;
            dst[px + 1] = g;
            dst[px + 2] = r;
            dst[px + 3] = 255;
        }
    }
}

/// Convert packed YUYV 4:2:2 (two pixels per Y0 U Y1 V group) to BGRA.
pub fn yuyv_to_bgra(src: &[u8], width: usize, height: usize, dst: &mut [u8]) {
    debug_assert!(width % 2 == 0);
    debug_assert!(src.len() >= width * height * 2);
    debug_assert!(dst.len() >= width * height * 4);

    for (group, chunk) in src[..width * height * 2].chunks_exact(4).enumerate() {
        let y0 = i32::from(chunk[0]);
        let u = i32::from(chunk[1]);
        let y1 = i32::from(chunk[2]);
        let v = i32::from(chunk[3]);

        let (r0, g0, b0) = yuv_to_rgb(y0, u, v);
        let (r1, g1, b1) = yuv_to_rgb(y1, u, v);

        let px = group * 8;
        dst[px] = b0;
        dst[px + 1] = g0;
        dst[px + 2] = r0;
        dst[px + 3] = 255;
        dst[px + 4] = b1;
        dst[px + 5] = g1;
        dst[px + 6] = r1;
        dst[px + 7] = 255;
    }
}
