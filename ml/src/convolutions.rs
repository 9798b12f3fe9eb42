use crate::{
    initializers::KernelInitializer,
    models::InternalDataRepresentation,
    parameters::{scoped, Parameterized},
    ConvKernel, ImagePrecision, WeightPrecision,
};
use ndarray::*;
use rand::Rng;

/// Padding scheme of a convolution.
///
/// `Same` follows the TensorFlow convention: the output has `ceil(input / stride)` rows and
/// columns, and if the total amount of padding is odd, the extra row (column) goes to the
/// bottom (right).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Same,
    Valid,
}

/// Rust implementation of a convolutional layer.
/// The weight matrix shall have dimension (in that order)
/// kernel height x kernel width x input channels x output channels
/// (the order in which keras saves its Conv2D kernels).
#[derive(Debug, Clone)]
pub struct ConvolutionLayer {
    /// Weight matrix of the kernel
    kernel: ConvKernel,
    /// One bias per output channel
    bias: Array1<WeightPrecision>,
    kernel_height: usize,
    kernel_width: usize,
    stride: usize,
    padding: Padding,
    num_input_channels: usize,
    num_output_channels: usize,
}

impl ConvolutionLayer {
    pub fn new(
        weights: ConvKernel,
        bias: Array1<WeightPrecision>,
        stride: usize,
        padding: Padding,
    ) -> ConvolutionLayer {
        let kernel_height = weights.len_of(Axis(0));
        let kernel_width = weights.len_of(Axis(1));
        let num_input_channels = weights.len_of(Axis(2));
        let num_output_channels = weights.len_of(Axis(3));

        debug_assert!(stride > 0, "Stride of 0 passed");
        debug_assert_eq!(bias.len(), num_output_channels);

        ConvolutionLayer {
            kernel: weights,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            num_input_channels,
            num_output_channels,
        }
    }

    /// Creates a stride 1 layer with freshly initialized kernel and zero bias.
    pub fn initialized<R: Rng + ?Sized>(
        kernel_size: usize,
        input_channels: usize,
        output_channels: usize,
        padding: Padding,
        initializer: KernelInitializer,
        rng: &mut R,
    ) -> ConvolutionLayer {
        let kernel = initializer.kernel(
            (kernel_size, kernel_size, input_channels, output_channels),
            rng,
        );
        ConvolutionLayer::new(kernel, Array1::zeros(output_channels), 1, padding)
    }

    pub fn input_channels(&self) -> usize {
        self.num_input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.num_output_channels
    }

    pub fn kernel(&self) -> &ConvKernel {
        &self.kernel
    }

    pub fn bias(&self) -> &Array1<WeightPrecision> {
        &self.bias
    }

    /// Performs a convolution on the given batch using this layers parameters.
    /// Every sample is flattened in im2col style, so the convolution becomes a single
    /// matrix product per sample. Read more here:
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    pub fn convolve(&self, image: &InternalDataRepresentation) -> InternalDataRepresentation {
        debug_assert_eq!(image.len_of(Axis(3)), self.num_input_channels);

        let padded = self.pad(image);
        let (batch, padded_height, padded_width, _) = padded.dim();

        // new_h = (H + 2 * P - HH) / S + 1, with the padding already applied
        let new_im_height = padded_height
            .checked_sub(self.kernel_height)
            .map_or(0, |rest| rest / self.stride + 1);
        let new_im_width = padded_width
            .checked_sub(self.kernel_width)
            .map_or(0, |rest| rest / self.stride + 1);

        let filter_col = self.filter_matrix();
        let mut output = Array4::zeros((
            batch,
            new_im_height,
            new_im_width,
            self.num_output_channels,
        ));

        for (sample, mut out_sample) in padded.outer_iter().zip(output.outer_iter_mut()) {
            let im_col = self.im2col_ref(sample, new_im_height, new_im_width);
            let activations = im_col.dot(&filter_col) + &self.bias;
            for (idx, row) in activations.outer_iter().enumerate() {
                out_sample
                    .slice_mut(s![idx / new_im_width, idx % new_im_width, ..])
                    .assign(&row);
            }
        }
        output
    }

    /// Returns (top, bottom, left, right) padding for an input of the given size.
    pub fn get_padding_size(&self, height: usize, width: usize) -> (usize, usize, usize, usize) {
        let (pad_top, pad_bottom) = self.padding_1d(height, self.kernel_height);
        let (pad_left, pad_right) = self.padding_1d(width, self.kernel_width);
        (pad_top, pad_bottom, pad_left, pad_right)
    }

    fn padding_1d(&self, size: usize, kernel: usize) -> (usize, usize) {
        match self.padding {
            Padding::Valid => (0, 0),
            Padding::Same => {
                let out = (size + self.stride - 1) / self.stride;
                let total = (out.saturating_sub(1) * self.stride + kernel).saturating_sub(size);
                (total / 2, total - total / 2)
            }
        }
    }

    fn pad(&self, image: &InternalDataRepresentation) -> InternalDataRepresentation {
        let (batch, height, width, channels) = image.dim();
        let (pad_top, pad_bottom, pad_left, pad_right) = self.get_padding_size(height, width);
        if pad_top + pad_bottom + pad_left + pad_right == 0 {
            return image.to_owned();
        }

        let mut padded = Array4::zeros((
            batch,
            height + pad_top + pad_bottom,
            width + pad_left + pad_right,
            channels,
        ));
        // https://github.com/rust-ndarray/ndarray/issues/823
        padded
            .slice_mut(s![.., pad_top..pad_top + height, pad_left..pad_left + width, ..])
            .assign(image);
        padded
    }

    /// Kernel reshaped to (HH * WW * C, F), rows ordered like the im2col patches.
    fn filter_matrix(&self) -> Array2<WeightPrecision> {
        let c_in = self.num_input_channels;
        Array2::from_shape_fn(
            (
                self.kernel_height * self.kernel_width * c_in,
                self.num_output_channels,
            ),
            |(row, filter)| {
                let channel = row % c_in;
                let kw = (row / c_in) % self.kernel_width;
                let kh = row / (c_in * self.kernel_width);
                self.kernel[[kh, kw, channel, filter]]
            },
        )
    }

    /// One row per output pixel, holding the (HH, WW, C) patch it is computed from.
    fn im2col_ref(
        &self,
        sample: ArrayView3<ImagePrecision>,
        new_h: usize,
        new_w: usize,
    ) -> Array2<ImagePrecision> {
        let mut img_matrix: Array2<ImagePrecision> = Array::zeros((
            new_h * new_w,
            self.kernel_height * self.kernel_width * self.num_input_channels,
        ));
        let mut cont = 0;
        for i in 0..new_h {
            let i_with_stride = i * self.stride;
            for j in 0..new_w {
                let j_with_stride = j * self.stride;
                let patch = sample.slice(s![
                    i_with_stride..(i_with_stride + self.kernel_height),
                    j_with_stride..(j_with_stride + self.kernel_width),
                    ..
                ]);
                img_matrix
                    .row_mut(cont)
                    .iter_mut()
                    .zip(patch.iter())
                    .for_each(|(dst, src)| *dst = *src);
                cont += 1;
            }
        }
        img_matrix
    }
}

impl Parameterized for ConvolutionLayer {
    fn parameters(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, WeightPrecision>)> {
        vec![
            (scoped(prefix, "kernel"), self.kernel.view().into_dyn()),
            (scoped(prefix, "bias"), self.bias.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, WeightPrecision>)> {
        vec![
            (scoped(prefix, "kernel"), self.kernel.view_mut().into_dyn()),
            (scoped(prefix, "bias"), self.bias.view_mut().into_dyn()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Naive implementation of single channel 2d convolution for reference.
    fn conv_2d_naive(
        kernel: ArrayView2<ImagePrecision>,
        im2d: ArrayView2<ImagePrecision>,
        stride: usize,
    ) -> Array2<ImagePrecision> {
        let (kernel_height, kernel_width) = kernel.dim();
        let (im_height, im_width) = im2d.dim();
        let new_h = (im_height - kernel_height) / stride + 1;
        let new_w = (im_width - kernel_width) / stride + 1;

        Array::from_shape_fn((new_h, new_w), |(i, j)| {
            let patch = im2d.slice(s![
                i * stride..i * stride + kernel_height,
                j * stride..j * stride + kernel_width
            ]);
            (&patch * &kernel).sum()
        })
    }

    /// Wraps a single channel image into a (1, H, W, 1) batch.
    fn as_batch(img: &Array2<ImagePrecision>) -> InternalDataRepresentation {
        img.clone().insert_axis(Axis(0)).insert_axis(Axis(3))
    }

    fn single_channel_layer(
        kernel: Array2<WeightPrecision>,
        stride: usize,
        padding: Padding,
    ) -> ConvolutionLayer {
        let weights = kernel.insert_axis(Axis(2)).insert_axis(Axis(3));
        ConvolutionLayer::new(weights, array![0.], stride, padding)
    }

    #[test]
    fn test_2d_conv_single_channel() {
        let test_img = array![[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]];
        let conv_layer = single_channel_layer(array![[0., 1.], [-1., 0.]], 1, Padding::Valid);

        let convolved_image = conv_layer.convolve(&as_batch(&test_img));

        assert_eq!(
            convolved_image.slice(s![0, .., .., 0]),
            array![[1., 0.], [1., 0.]]
        );
    }

    #[test]
    fn test_2d_conv_with_stride() {
        let test_img: Array2<ImagePrecision> = array![[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]];
        let conv_layer = single_channel_layer(array![[1.]], 2, Padding::Valid);

        let convolved_image = conv_layer.convolve(&as_batch(&test_img));

        assert_eq!(
            convolved_image.slice(s![0, .., .., 0]),
            array![[0., 0.], [-1., 0.]]
        );
    }

    #[test]
    fn test_2d_conv_matches_naive() {
        let test_img = Array::from_shape_fn((5, 6), |(i, j)| (i * 6 + j) as f32 * 0.5 - 3.0);
        let kernel = array![[1., -2., 0.5], [0., 3., -1.], [2., 0.25, 1.]];
        let conv_layer = single_channel_layer(kernel.clone(), 1, Padding::Valid);

        let convolved_image = conv_layer.convolve(&as_batch(&test_img));

        assert_eq!(
            convolved_image.slice(s![0, .., .., 0]),
            conv_2d_naive(kernel.view(), test_img.view(), 1)
        );
    }

    #[test]
    fn test_2d_conv_multi_channel() {
        let channel = array![
            [1.0, 2.0, 3.0, 4.0],
            [4.0, 5.0, 6.0, 7.0],
            [7.0, 8.0, 9.0, 9.0],
            [7.0, 8.0, 9.0, 9.0]
        ];
        let test_img = Array::from_shape_fn((1, 4, 4, 3), |(_, i, j, _)| channel[[i, j]]);
        let kernel = Array::from_shape_fn((2, 2, 3, 1), |(_, kw, _, _)| (kw + 1) as f32);
        let conv_layer = ConvolutionLayer::new(kernel, array![0.], 1, Padding::Valid);

        let output = array![
            [57.0, 75.0, 93.0],
            [111.0, 129.0, 141.0],
            [138.0, 156.0, 162.0],
        ];
        let convolved_image = conv_layer.convolve(&test_img);

        assert_eq!(convolved_image.dim(), (1, 3, 3, 1));
        assert_eq!(convolved_image.slice(s![0, .., .., 0]), output);
    }

    #[test]
    fn test_same_padding_keeps_size() {
        let conv_layer = single_channel_layer(Array::ones((3, 3)), 1, Padding::Same);
        let convolved_image = conv_layer.convolve(&as_batch(&Array::ones((3, 3))));

        assert_eq!(
            convolved_image.slice(s![0, .., .., 0]),
            array![[4., 6., 4.], [6., 9., 6.], [4., 6., 4.]]
        );
    }

    #[test]
    fn test_even_kernel_same_padding_pads_bottom_right() {
        let conv_layer = single_channel_layer(Array::ones((2, 2)), 1, Padding::Same);
        assert_eq!(conv_layer.get_padding_size(2, 2), (0, 1, 0, 1));

        let convolved_image = conv_layer.convolve(&as_batch(&array![[1., 2.], [3., 4.]]));
        assert_eq!(
            convolved_image.slice(s![0, .., .., 0]),
            array![[10., 6.], [7., 4.]]
        );
    }

    #[test]
    fn test_pointwise_conv_mixes_channels_and_adds_bias() {
        // two input channels, three filters
        let kernel = Array::from_shape_vec((1, 1, 2, 3), vec![1., 0., 2., 0., 1., -1.]).unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, array![0.5, 0., 1.], 1, Padding::Same);
        let test_img = Array::from_shape_vec((2, 1, 1, 2), vec![1., 2., -1., 3.]).unwrap();

        let convolved_image = conv_layer.convolve(&test_img);

        assert_eq!(convolved_image.dim(), (2, 1, 1, 3));
        assert_eq!(convolved_image.slice(s![0, 0, 0, ..]), array![1.5, 2., 1.]);
        assert_eq!(convolved_image.slice(s![1, 0, 0, ..]), array![-0.5, 3., -4.]);
    }

    #[test]
    fn test_parameters_are_named_by_prefix() {
        let conv_layer = single_channel_layer(array![[1.]], 1, Padding::Valid);
        let names: Vec<String> = conv_layer
            .parameters("head")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["head.kernel", "head.bias"]);
    }
}
