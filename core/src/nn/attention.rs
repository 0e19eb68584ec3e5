//! Multi-head attention with grouped-query support.
//!
//! Shapes used throughout:
//! - hidden states: `[batch, seq, hidden]`
//! - per-head tensors: `[batch, heads, seq, head_dim]`

use super::linear::Linear;
use super::module::{Parameter, Parameters};
use super::rope::{Rotary, apply_rotary};
use crate::autograd::{Function, Variable, apply};
use crate::error::{Error, Result};
use crate::kernels::{block_backward, block_forward};
use crate::tensor::{Cpu, Tensor, TensorElem};
use num_traits::Float;
use std::fmt::Debug;
use std::rc::Rc;

/// Read-only view of an attention layer's configuration and weights.
///
/// This is all a replacement implementation needs to rebuild an equivalent layer.
pub trait AttentionSource<T: TensorElem> {
    fn hidden_size(&self) -> usize;
    fn num_heads(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn head_dim(&self) -> usize;
    fn is_causal(&self) -> bool;
    fn q_proj(&self) -> &Linear<T>;
    fn k_proj(&self) -> &Linear<T>;
    fn v_proj(&self) -> &Linear<T>;
    fn o_proj(&self) -> &Linear<T>;
    /// Rotary tables, shared by reference with the rest of the model.
    fn rotary(&self) -> Option<&Rc<Rotary<T>>>;
}

/// An attention layer a model can hold in one of its slots.
pub trait AttentionModule<T: TensorElem>: Parameters<T> + Debug {
    /// `x` is `[batch, seq, hidden]`; `positions[t]` is the absolute position of row `t`.
    fn forward(&self, x: &Variable<T, 3>, positions: &[usize]) -> Result<Variable<T, 3>>;

    fn source(&self) -> &dyn AttentionSource<T>;

    /// Whether this layer already runs ring attention.
    fn is_ring(&self) -> bool {
        false
    }
}

/// Head geometry shared by the attention implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLayout {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl HeadLayout {
    pub fn validate<T: TensorElem + 'static>(
        &self,
        q: &Linear<T>,
        k: &Linear<T>,
        v: &Linear<T>,
        o: &Linear<T>,
    ) -> Result<()> {
        let Self {
            num_heads,
            num_kv_heads,
            head_dim,
        } = *self;
        if num_heads == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(Error::Config(format!("empty head layout {self:?}")));
        }
        if num_heads % num_kv_heads != 0 {
            return Err(Error::Config(format!(
                "{num_heads} query heads cannot be grouped over {num_kv_heads} key/value heads"
            )));
        }
        let hidden = q.in_features();
        let expect = [
            ("q_proj", q, num_heads * head_dim, hidden),
            ("k_proj", k, num_kv_heads * head_dim, hidden),
            ("v_proj", v, num_kv_heads * head_dim, hidden),
            ("o_proj", o, hidden, num_heads * head_dim),
        ];
        for (name, layer, out, inp) in expect {
            if layer.weight.shape() != &[out, inp] {
                return Err(Error::Config(format!(
                    "{name} weight is {:?}, expected [{out}, {inp}]",
                    layer.weight.shape()
                )));
            }
        }
        Ok(())
    }

    /// Rotary tables must rotate vectors of exactly `head_dim` components.
    pub fn check_rotary<T>(&self, rotary: Option<&Rc<Rotary<T>>>) -> Result<()>
    where
        T: TensorElem + Float,
    {
        match rotary {
            Some(r) if r.head_dim() != self.head_dim => Err(Error::Config(format!(
                "rotary head_dim {} does not match attention head_dim {}",
                r.head_dim(),
                self.head_dim
            ))),
            _ => Ok(()),
        }
    }

    pub fn n_rep(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

// --- RepeatKv ---
/// Repeats every key/value head `n_rep` times so it lines up with its query-head group.
struct RepeatKvFn {
    n_rep: usize,
}

impl<T: TensorElem> Function<T, 4, 4> for RepeatKvFn {
    type Saved = ();

    fn name(&self) -> &'static str {
        "repeat_kv"
    }

    fn forward(&self, inputs: &[&Tensor<T, 4, Cpu>]) -> Result<(Tensor<T, 4, Cpu>, ())> {
        let [x] = inputs else {
            return Err(Error::Autograd("repeat_kv takes one input".into()));
        };
        let [b, kvh, s, d] = *x.shape();
        let head = s * d;
        let src = x.data();
        let out = Tensor::from_fn([b, kvh * self.n_rep, s, d], |idx| {
            let (bh, within) = (idx / head, idx % head);
            let (bi, h) = (bh / (kvh * self.n_rep), bh % (kvh * self.n_rep));
            src[(bi * kvh + h / self.n_rep) * head + within]
        });
        Ok((out, ()))
    }

    fn backward(&self, _: (), grad: &Tensor<T, 4, Cpu>) -> Result<Vec<Option<Tensor<T, 4, Cpu>>>> {
        let [b, h, s, d] = *grad.shape();
        let kvh = h / self.n_rep;
        let head = s * d;
        let mut dx = Tensor::zeros([b, kvh, s, d]);
        let g = grad.data();
        for (bh, chunk) in dx.data_mut().chunks_mut(head).enumerate() {
            let (bi, kv) = (bh / kvh, bh % kvh);
            for r in 0..self.n_rep {
                let src = (bi * h + kv * self.n_rep + r) * head;
                for (o, &x) in chunk.iter_mut().zip(&g[src..src + head]) {
                    *o += x;
                }
            }
        }
        Ok(vec![Some(dx)])
    }
}

pub fn repeat_kv<T: TensorElem + 'static>(
    x: &Variable<T, 4>,
    n_rep: usize,
) -> Result<Variable<T, 4>> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    apply(RepeatKvFn { n_rep }, &[x])
}

// --- Local attention ---
/// Softmax attention over the full local sequence, on one worker.
struct LocalAttentionFn {
    scale: f64,
    causal: bool,
}

type LocalSaved<T> = [Tensor<T, 4, Cpu>; 4];

impl<T: TensorElem + Float> Function<T, 4, 4> for LocalAttentionFn {
    /// `[q, k, v, out]` plus the log-sum-exp.
    type Saved = (LocalSaved<T>, Tensor<f64, 3, Cpu>);

    fn name(&self) -> &'static str {
        "attention"
    }

    fn forward(&self, inputs: &[&Tensor<T, 4, Cpu>]) -> Result<(Tensor<T, 4, Cpu>, Self::Saved)> {
        let [q, k, v] = inputs else {
            return Err(Error::Autograd("attention takes [q, k, v]".into()));
        };
        let block = block_forward(q, k, v, self.scale, self.causal)?;
        let out: Tensor<T, 4, Cpu> = block.out.cast()?;
        let saved = [(*q).clone(), (*k).clone(), (*v).clone(), out.clone()];
        Ok((out, (saved, block.lse)))
    }

    fn backward(
        &self,
        ([q, k, v, out], lse): Self::Saved,
        grad: &Tensor<T, 4, Cpu>,
    ) -> Result<Vec<Option<Tensor<T, 4, Cpu>>>> {
        let g = block_backward(&q, &k, &v, &out, grad, &lse, self.scale, self.causal)?;
        Ok(vec![
            Some(g.dq.cast()?),
            Some(g.dk.cast()?),
            Some(g.dv.cast()?),
        ])
    }
}

/// Single-worker scaled dot-product attention on `[batch, heads, seq, head_dim]` variables.
pub fn local_attention<T: TensorElem + Float + 'static>(
    q: &Variable<T, 4>,
    k: &Variable<T, 4>,
    v: &Variable<T, 4>,
    scale: f64,
    causal: bool,
) -> Result<Variable<T, 4>> {
    apply(LocalAttentionFn { scale, causal }, &[q, k, v])
}

/// `[batch, seq, heads * head_dim]` to `[batch, heads, seq, head_dim]`.
fn split_heads<T: TensorElem + 'static>(
    x: &Variable<T, 3>,
    heads: usize,
    head_dim: usize,
) -> Result<Variable<T, 4>> {
    let [b, s, _] = *x.shape();
    x.reshape([b, s, heads, head_dim])?.transpose_axes(1, 2)
}

fn merge_heads<T: TensorElem + 'static>(x: &Variable<T, 4>) -> Result<Variable<T, 3>> {
    let [b, h, s, d] = *x.shape();
    x.transpose_axes(1, 2)?.reshape([b, s, h * d])
}

/// The attention pipeline around a pluggable core: project, split heads, rotate, repeat K/V,
/// attend, merge heads, project out.
pub(crate) fn attention_pipeline<T, F>(
    src: &dyn AttentionSource<T>,
    x: &Variable<T, 3>,
    positions: &[usize],
    attend: F,
) -> Result<Variable<T, 3>>
where
    T: TensorElem + Float + 'static,
    F: FnOnce(&Variable<T, 4>, &Variable<T, 4>, &Variable<T, 4>) -> Result<Variable<T, 4>>,
{
    let (h, kvh, d) = (src.num_heads(), src.num_kv_heads(), src.head_dim());
    let mut q = split_heads(&src.q_proj().forward(x)?, h, d)?;
    let mut k = split_heads(&src.k_proj().forward(x)?, kvh, d)?;
    let v = split_heads(&src.v_proj().forward(x)?, kvh, d)?;

    if let Some(rotary) = src.rotary() {
        q = apply_rotary(rotary, &q, positions)?;
        k = apply_rotary(rotary, &k, positions)?;
    }

    let k = repeat_kv(&k, h / kvh)?;
    let v = repeat_kv(&v, h / kvh)?;

    let out = attend(&q, &k, &v)?;
    src.o_proj().forward(&merge_heads(&out)?)
}

/// Plain multi-head attention running on one worker.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention<T: TensorElem> {
    pub q_proj: Linear<T>,
    pub k_proj: Linear<T>,
    pub v_proj: Linear<T>,
    pub o_proj: Linear<T>,
    pub layout: HeadLayout,
    pub causal: bool,
    pub rotary: Option<Rc<Rotary<T>>>,
}

impl<T: TensorElem + Float + 'static> MultiHeadAttention<T> {
    pub fn new(
        layout: HeadLayout,
        [q_proj, k_proj, v_proj, o_proj]: [Linear<T>; 4],
        causal: bool,
        rotary: Option<Rc<Rotary<T>>>,
    ) -> Result<Self> {
        layout.validate(&q_proj, &k_proj, &v_proj, &o_proj)?;
        layout.check_rotary(rotary.as_ref())?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            layout,
            causal,
            rotary,
        })
    }
}

impl<T: TensorElem + 'static> Parameters<T> for MultiHeadAttention<T> {
    fn parameters(&self) -> Vec<&dyn Parameter<T>> {
        vec![
            &self.q_proj.weight,
            &self.k_proj.weight,
            &self.v_proj.weight,
            &self.o_proj.weight,
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut dyn Parameter<T>> {
        vec![
            &mut self.q_proj.weight,
            &mut self.k_proj.weight,
            &mut self.v_proj.weight,
            &mut self.o_proj.weight,
        ]
    }
}

impl<T: TensorElem + 'static> AttentionSource<T> for MultiHeadAttention<T> {
    fn hidden_size(&self) -> usize {
        self.q_proj.in_features()
    }
    fn num_heads(&self) -> usize {
        self.layout.num_heads
    }
    fn num_kv_heads(&self) -> usize {
        self.layout.num_kv_heads
    }
    fn head_dim(&self) -> usize {
        self.layout.head_dim
    }
    fn is_causal(&self) -> bool {
        self.causal
    }
    fn q_proj(&self) -> &Linear<T> {
        &self.q_proj
    }
    fn k_proj(&self) -> &Linear<T> {
        &self.k_proj
    }
    fn v_proj(&self) -> &Linear<T> {
        &self.v_proj
    }
    fn o_proj(&self) -> &Linear<T> {
        &self.o_proj
    }
    fn rotary(&self) -> Option<&Rc<Rotary<T>>> {
        self.rotary.as_ref()
    }
}

impl<T: TensorElem + Float + 'static> AttentionModule<T> for MultiHeadAttention<T> {
    fn forward(&self, x: &Variable<T, 3>, positions: &[usize]) -> Result<Variable<T, 3>> {
        let scale = 1.0 / (self.layout.head_dim as f64).sqrt();
        attention_pipeline(self, x, positions, |q, k, v| {
            local_attention(q, k, v, scale, self.causal)
        })
    }

    fn source(&self) -> &dyn AttentionSource<T> {
        self
    }
}
