//! Weighted naive Bayes over destination features.
//!
//! At load time each fingerprint's process list is compiled into a cached
//! log-prior vector plus one update table per feature, mapping an observed
//! feature value to the `(process index, delta)` pairs it contributes.
//! Classification is then a vector copy and O(#features) hash probes,
//! independent of the number of processes.

use std::collections::HashMap;

use log::warn;

pub const NUM_FEATURES: usize = 6;

/// Feature order: as, domain, port, ip, sni, ua.
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = ["as", "domain", "port", "ip", "sni", "ua"];

pub const DEFAULT_FEATURE_WEIGHTS: [f64; NUM_FEATURES] = [
    0.13924, // as
    0.15590, // domain
    0.00528, // port
    0.56735, // ip
    0.96941, // sni
    1.0,     // ua
];

pub type FeatureWeights = [f64; NUM_FEATURES];

pub fn feature_index(name: &str) -> Option<usize> {
    FEATURE_NAMES.iter().position(|&n| n == name)
}

/// The per-process feature counts of one process under one fingerprint,
/// as loaded from the database.
pub struct ProcessCounts {
    pub count: u64,
    pub ip_as: HashMap<u32, u64>,
    pub hostname_domains: HashMap<String, u64>,
    pub dst_port: HashMap<u16, u64>,
    pub ip_ip: HashMap<String, u64>,
    pub hostname_sni: HashMap<String, u64>,
    pub user_agent: HashMap<String, u64>,
}

/// One additive update to a process score.
#[derive(Debug, Clone, Copy)]
struct Update {
    index: usize,
    value: f64,
}

pub struct NaiveBayes {
    total_count: u64,
    base_prior: f64,
    process_prob: Vec<f64>,
    as_updates: HashMap<u32, Vec<Update>>,
    domain_updates: HashMap<String, Vec<Update>>,
    port_updates: HashMap<u16, Vec<Update>>,
    ip_updates: HashMap<String, Vec<Update>>,
    sni_updates: HashMap<String, Vec<Update>>,
    ua_updates: HashMap<String, Vec<Update>>,
    weights: FeatureWeights,
}

impl NaiveBayes {
    pub fn new(processes: &[ProcessCounts], total_count: u64, weights: FeatureWeights) -> Self {
        let total_count = total_count.max(1);
        let base_prior = (0.1 / total_count as f64).ln();
        let weight_sum: f64 = weights.iter().sum();

        let mut nb = NaiveBayes {
            total_count,
            base_prior,
            process_prob: Vec::with_capacity(processes.len()),
            as_updates: HashMap::new(),
            domain_updates: HashMap::new(),
            port_updates: HashMap::new(),
            ip_updates: HashMap::new(),
            sni_updates: HashMap::new(),
            ua_updates: HashMap::new(),
            weights,
        };

        for (index, p) in processes.iter().enumerate() {
            let proc_prior = 0.1f64.ln();
            let score = (p.count as f64 / total_count as f64).ln();
            nb.process_prob
                .push(score.max(proc_prior) + base_prior * weight_sum);

            let delta = |count: u64, weight: f64| Update {
                index,
                value: ((count as f64 / total_count as f64).ln() - base_prior) * weight,
            };
            for (&asn, &count) in &p.ip_as {
                nb.as_updates
                    .entry(asn)
                    .or_default()
                    .push(delta(count, weights[0]));
            }
            for (domain, &count) in &p.hostname_domains {
                nb.domain_updates
                    .entry(domain.clone())
                    .or_default()
                    .push(delta(count, weights[1]));
            }
            for (&port, &count) in &p.dst_port {
                nb.port_updates
                    .entry(port)
                    .or_default()
                    .push(delta(count, weights[2]));
            }
            for (ip, &count) in &p.ip_ip {
                nb.ip_updates
                    .entry(ip.clone())
                    .or_default()
                    .push(delta(count, weights[3]));
            }
            for (sni, &count) in &p.hostname_sni {
                nb.sni_updates
                    .entry(sni.clone())
                    .or_default()
                    .push(delta(count, weights[4]));
            }
            for (ua, &count) in &p.user_agent {
                nb.ua_updates
                    .entry(ua.clone())
                    .or_default()
                    .push(delta(count, weights[5]));
            }
        }
        nb
    }

    pub fn num_processes(&self) -> usize {
        self.process_prob.len()
    }

    /// Scores every process for the presented destination features.
    pub fn classify(
        &self,
        asn: u32,
        dst_port: u16,
        domain: &str,
        server_name: &str,
        dst_ip: &str,
        user_agent: Option<&str>,
    ) -> Vec<f64> {
        let mut score = self.process_prob.clone();
        let apply = |score: &mut Vec<f64>, updates: Option<&Vec<Update>>| {
            if let Some(updates) = updates {
                for u in updates {
                    score[u.index] += u.value;
                }
            }
        };
        apply(&mut score, self.as_updates.get(&asn));
        apply(&mut score, self.port_updates.get(&dst_port));
        apply(&mut score, self.domain_updates.get(domain));
        apply(&mut score, self.ip_updates.get(dst_ip));
        apply(&mut score, self.sni_updates.get(server_name));
        if let Some(ua) = user_agent {
            apply(&mut score, self.ua_updates.get(ua));
        }
        score
    }

    /// Re-weights the cached tables in place, avoiding a database reload
    /// when tuning weights. Deltas scale by `new/old`; the prior vector's
    /// constant term is adjusted by the change in the weight sum.
    pub fn recompute_probabilities(&mut self, new_weights: FeatureWeights) {
        if new_weights == self.weights {
            return;
        }
        let old_sum: f64 = self.weights.iter().sum();
        let new_sum: f64 = new_weights.iter().sum();
        for p in &mut self.process_prob {
            *p = *p - self.base_prior * old_sum + self.base_prior * new_sum;
        }

        let scale = |updates: &mut Vec<Update>, old_w: f64, new_w: f64| {
            if old_w == 0.0 {
                if new_w != 0.0 {
                    warn!("cannot rescale feature weight from zero; reload required");
                }
                return;
            }
            for u in updates {
                u.value = u.value * new_w / old_w;
            }
        };
        for v in self.as_updates.values_mut() {
            scale(v, self.weights[0], new_weights[0]);
        }
        for v in self.domain_updates.values_mut() {
            scale(v, self.weights[1], new_weights[1]);
        }
        for v in self.port_updates.values_mut() {
            scale(v, self.weights[2], new_weights[2]);
        }
        for v in self.ip_updates.values_mut() {
            scale(v, self.weights[3], new_weights[3]);
        }
        for v in self.sni_updates.values_mut() {
            scale(v, self.weights[4], new_weights[4]);
        }
        for v in self.ua_updates.values_mut() {
            scale(v, self.weights[5], new_weights[5]);
        }
        self.weights = new_weights;
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_processes() -> Vec<ProcessCounts> {
        let mut a = ProcessCounts {
            count: 90,
            ip_as: HashMap::new(),
            hostname_domains: HashMap::new(),
            dst_port: HashMap::new(),
            ip_ip: HashMap::new(),
            hostname_sni: HashMap::new(),
            user_agent: HashMap::new(),
        };
        a.hostname_sni.insert("a.example.com".to_string(), 80);
        let mut b = ProcessCounts {
            count: 10,
            ip_as: HashMap::new(),
            hostname_domains: HashMap::new(),
            dst_port: HashMap::new(),
            ip_ip: HashMap::new(),
            hostname_sni: HashMap::new(),
            user_agent: HashMap::new(),
        };
        b.hostname_sni.insert("b.example.com".to_string(), 9);
        vec![a, b]
    }

    #[test]
    fn matching_feature_shifts_winner() {
        let nb = NaiveBayes::new(&two_processes(), 100, DEFAULT_FEATURE_WEIGHTS);
        let neutral = nb.classify(0, 443, "example.com", "other", "1.2.3.4", None);
        assert!(neutral[0] > neutral[1], "prior favors the common process");
        let b_sni = nb.classify(0, 443, "example.com", "b.example.com", "1.2.3.4", None);
        assert!(
            b_sni[1] - neutral[1] > b_sni[0] - neutral[0],
            "sni evidence moves the rare process up"
        );
    }

    #[test]
    fn recompute_matches_rebuild() {
        let procs = two_processes();
        let mut nb = NaiveBayes::new(&procs, 100, DEFAULT_FEATURE_WEIGHTS);
        let mut new_weights = DEFAULT_FEATURE_WEIGHTS;
        new_weights[4] = 0.5;
        nb.recompute_probabilities(new_weights);
        let rebuilt = NaiveBayes::new(&procs, 100, new_weights);
        let a = nb.classify(0, 443, "d", "b.example.com", "ip", None);
        let b = rebuilt.classify(0, 443, "d", "b.example.com", "ip", None);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-9, "{} != {}", x, y);
        }
    }
}
